//! In-process work queue.
//!
//! Same delivery semantics as the Redis queue (visibility leases, receive
//! counts, dead-lettering) without a server. Time is read from
//! `tokio::time`, so tests running with a paused clock can expire leases
//! by advancing it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::{QueueDepth, ReceivedMessage, WorkQueue};

#[derive(Debug)]
struct Entry {
    body: String,
    receive_count: u32,
    /// `None` until first received
    hidden_until: Option<Instant>,
    receipt: Option<String>,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        self.hidden_until.map(|t| t <= now).unwrap_or(true)
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
    dead_letters: Vec<String>,
    deleted: u64,
}

/// In-memory [`WorkQueue`].
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    arrivals: Notify,
    visibility_timeout: Duration,
    max_receives: Option<u32>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(900))
    }
}

impl MemoryQueue {
    /// Queue without a receive limit.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            visibility_timeout,
            max_receives: None,
        }
    }

    /// Dead-letter messages once they have been delivered `max` times.
    pub fn with_max_receives(mut self, max: u32) -> Self {
        self.max_receives = Some(max);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages not yet deleted or dead-lettered.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful deletes.
    pub fn deleted_count(&self) -> u64 {
        self.lock().deleted
    }

    /// Bodies of dead-lettered messages, oldest first.
    pub fn dead_letters(&self) -> Vec<String> {
        self.lock().dead_letters.clone()
    }

    /// Bodies of all undeleted messages, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.lock().entries.values().map(|e| e.body.clone()).collect()
    }

    fn take_visible(&self, state: &mut State, now: Instant) -> Option<ReceivedMessage> {
        loop {
            let id = state
                .entries
                .iter()
                .find(|(_, e)| e.is_visible(now))
                .map(|(id, _)| *id)?;

            let over_limit = self
                .max_receives
                .zip(state.entries.get(&id))
                .map(|(max, e)| e.receive_count >= max)
                .unwrap_or(false);

            if over_limit {
                if let Some(entry) = state.entries.remove(&id) {
                    warn!(
                        message_id = id,
                        receive_count = entry.receive_count,
                        "Moved message to DLQ after too many deliveries"
                    );
                    state.dead_letters.push(entry.body);
                }
                continue;
            }

            let entry = state.entries.get_mut(&id)?;
            entry.receive_count += 1;
            entry.hidden_until = Some(now + self.visibility_timeout);
            let receipt = format!("{id}:{}", entry.receive_count);
            entry.receipt = Some(receipt.clone());

            return Some(ReceivedMessage {
                message_id: id.to_string(),
                receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
    }

    fn find_by_receipt<'a>(state: &'a mut State, receipt: &str) -> Option<(u64, &'a mut Entry)> {
        state
            .entries
            .iter_mut()
            .find(|(_, e)| e.receipt.as_deref() == Some(receipt))
            .map(|(id, e)| (*id, e))
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, body: &str) -> QueueResult<String> {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(
                id,
                Entry {
                    body: body.to_string(),
                    receive_count: 0,
                    hidden_until: None,
                    receipt: None,
                },
            );
            id
        };
        self.arrivals.notify_waiters();
        debug!(message_id = id, "Sent message");
        Ok(id.to_string())
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            // Registered before the state check so a send in between wakes us.
            let arrival = self.arrivals.notified();

            let next_visible = {
                let mut state = self.lock();
                let now = Instant::now();
                if let Some(message) = self.take_visible(&mut state, now) {
                    return Ok(Some(message));
                }
                state.entries.values().filter_map(|e| e.hidden_until).min()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, arrival).await;
        }
    }

    async fn delete(&self, receipt: &str) -> QueueResult<()> {
        let mut state = self.lock();
        let (id, _) = Self::find_by_receipt(&mut state, receipt)
            .ok_or_else(|| QueueError::invalid_receipt(receipt))?;
        state.entries.remove(&id);
        state.deleted += 1;
        debug!(message_id = id, "Deleted message");
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &str, lease: Duration) -> QueueResult<()> {
        let mut state = self.lock();
        let (_, entry) = Self::find_by_receipt(&mut state, receipt)
            .ok_or_else(|| QueueError::invalid_receipt(receipt))?;
        entry.hidden_until = Some(Instant::now() + lease);
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let state = self.lock();
        let now = Instant::now();
        let visible = state.entries.values().filter(|e| e.is_visible(now)).count() as u64;
        Ok(QueueDepth {
            visible,
            in_flight: state.entries.len() as u64 - visible,
            dead_lettered: state.dead_letters.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_receive_hides_message_until_lease_expires() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send("a").await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.body, "a");
        assert_eq!(first.receive_count, 1);
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.receive_count, 2);
        assert_ne!(second.receipt, first.receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_empty() {
        let queue = MemoryQueue::default();
        let started = Instant::now();
        assert!(queue
            .receive(Duration::from_secs(20))
            .await
            .unwrap()
            .is_none());
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_wakes_on_send() {
        let queue = Arc::new(MemoryQueue::default());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Duration::from_secs(20)).await })
        };
        tokio::task::yield_now().await;
        queue.send("late").await.unwrap();

        let message = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(message.body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_visibility_postpones_redelivery() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send("a").await.unwrap();
        let message = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        queue
            .extend_visibility(&message.receipt, Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_requires_current_receipt() {
        let queue = MemoryQueue::default();
        queue.send("a").await.unwrap();
        let message = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        assert!(matches!(
            queue.delete("bogus").await,
            Err(QueueError::InvalidReceipt(_))
        ));
        queue.delete(&message.receipt).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.deleted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_after_max_receives() {
        let queue = MemoryQueue::new(Duration::from_secs(1)).with_max_receives(2);
        queue.send("poison").await.unwrap();

        for _ in 0..2 {
            assert!(queue.receive(Duration::ZERO).await.unwrap().is_some());
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(queue.dead_letters(), vec!["poison".to_string()]);

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth, QueueDepth { visible: 0, in_flight: 0, dead_lettered: 1 });
    }
}
