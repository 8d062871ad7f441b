//! Lease extension while a job is being processed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use transq_models::JobId;
use transq_queue::WorkQueue;
use transq_registry::LockManager;

use crate::metrics;
use crate::retry::FailureTracker;
use crate::shutdown::wait_for_shutdown;

/// Consecutive failed beats logged before the rest are suppressed.
const MAX_LOGGED_FAILURES: u32 = 3;

/// What the heartbeat keeps alive.
#[derive(Clone)]
pub struct HeartbeatTarget {
    pub queue: Arc<dyn WorkQueue>,
    pub locks: LockManager,
    pub job_id: JobId,
    pub worker_id: String,
    /// Receipt of the message being processed
    pub receipt: String,
}

/// Counters returned when the heartbeat stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub beats: u32,
    pub lock_failures: u32,
    pub visibility_failures: u32,
}

/// Background task extending message visibility and the job lock together.
///
/// Stop it with [`Heartbeat::stop`]. Dropping it aborts the task, so the
/// lease stops being extended even if the owner unwinds.
pub struct Heartbeat {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<HeartbeatStats>>,
}

impl Heartbeat {
    /// Spawn the task. The first beat happens one `interval` from now.
    pub fn start(target: HeartbeatTarget, interval: Duration, lease: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(beat(target, interval, lease, stop_rx));
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the task and wait for it to finish its current beat.
    pub async fn stop(mut self) -> HeartbeatStats {
        let _ = self.stop_tx.send(true);
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => HeartbeatStats::default(),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn beat(
    target: HeartbeatTarget,
    interval: Duration,
    lease: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> HeartbeatStats {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tracker = FailureTracker::new(MAX_LOGGED_FAILURES);
    let mut stats = HeartbeatStats::default();

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut stop_rx) => break,
            _ = ticker.tick() => {}
        }

        let (visibility, locked) = tokio::join!(
            target.queue.extend_visibility(&target.receipt, lease),
            target.locks.extend(&target.job_id, &target.worker_id, lease),
        );
        stats.beats += 1;

        let visibility_error = visibility.err();
        if visibility_error.is_some() {
            stats.visibility_failures += 1;
            metrics::record_heartbeat_failure("queue");
        }
        if !locked {
            stats.lock_failures += 1;
            metrics::record_heartbeat_failure("lock");
        }

        if visibility_error.is_none() && locked {
            tracker.record_success();
            debug!(job_id = %target.job_id, worker_id = %target.worker_id, "Heartbeat");
        } else if tracker.record_failure() {
            warn!(
                job_id = %target.job_id,
                worker_id = %target.worker_id,
                lock_extended = locked,
                visibility_error = %visibility_error.map(|e| e.to_string()).unwrap_or_default(),
                "Heartbeat failed"
            );
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use transq_models::{Job, JobStatus, ManualClock};
    use transq_queue::MemoryQueue;
    use transq_registry::{JobRegistry, MemoryRegistry};

    const LEASE: Duration = Duration::from_secs(900);
    const INTERVAL: Duration = Duration::from_secs(120);

    async fn setup() -> (HeartbeatTarget, Arc<MemoryRegistry>, Arc<ManualClock>) {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(ManualClock::at_epoch(10_000));
        let locks = LockManager::new(registry.clone(), clock.clone());
        let job = Job::new(JobId::from("v1"), "owner-1", "raw/v1.mov", "out/v1.mp4", json!({}), Utc::now());
        registry.create(&job).await.unwrap();
        assert!(locks.try_acquire(&job.job_id, "worker-a", LEASE).await.unwrap());

        let queue = Arc::new(MemoryQueue::new(LEASE));
        queue.send("{}").await.unwrap();
        let received = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        let target = HeartbeatTarget {
            queue,
            locks,
            job_id: job.job_id,
            worker_id: "worker-a".into(),
            receipt: received.receipt,
        };
        (target, registry, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_push_lock_forward() {
        let (target, registry, clock) = setup().await;
        let job_id = target.job_id.clone();
        let heartbeat = Heartbeat::start(target, INTERVAL, LEASE);

        clock.advance_secs(300);
        tokio::time::sleep(Duration::from_secs(250)).await;
        let stats = heartbeat.stop().await;

        assert_eq!(stats.beats, 2);
        assert_eq!(stats.lock_failures, 0);
        assert_eq!(stats.visibility_failures, 0);
        let job = registry.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.lock_expires_at, Some(11_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lock_is_counted_not_fatal() {
        let (target, _, _) = setup().await;
        target
            .locks
            .release(&target.job_id, JobStatus::Failed, None)
            .await
            .unwrap();
        let heartbeat = Heartbeat::start(target, INTERVAL, LEASE);

        tokio::time::sleep(Duration::from_secs(370)).await;
        let stats = heartbeat.stop().await;
        assert_eq!(stats.beats, 3);
        assert_eq!(stats.lock_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_task() {
        let (target, registry, clock) = setup().await;
        let job_id = target.job_id.clone();
        drop(Heartbeat::start(target, INTERVAL, LEASE));

        clock.advance_secs(300);
        tokio::time::sleep(Duration::from_secs(600)).await;
        let job = registry.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.lock_expires_at, Some(10_900));
    }
}
