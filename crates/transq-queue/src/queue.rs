//! Work queue abstraction.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for work messages
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Stream receiving completion notifications
    pub notify_stream_name: String,
    /// Deliveries before a message is dead-lettered
    pub max_receives: u32,
    /// How long a received message stays invisible to other consumers
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "transq:jobs".to_string(),
            consumer_group: "transq:workers".to_string(),
            dlq_stream_name: "transq:dlq".to_string(),
            notify_stream_name: "transq:notify".to_string(),
            max_receives: 5,
            visibility_timeout: Duration::from_secs(900), // 15 minutes
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            notify_stream_name: std::env::var("NOTIFY_STREAM")
                .unwrap_or(defaults.notify_stream_name),
            max_receives: std::env::var("QUEUE_MAX_RECEIVES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_receives),
            visibility_timeout: Duration::from_secs(
                std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.visibility_timeout.as_secs()),
            ),
        }
    }

    /// Config for the completion notification stream.
    ///
    /// Same server and group; messages go to `notify_stream_name` and dead
    /// letters to `<notify stream>:dlq`.
    pub fn notify(&self) -> Self {
        Self {
            stream_name: self.notify_stream_name.clone(),
            dlq_stream_name: format!("{}:dlq", self.notify_stream_name),
            ..self.clone()
        }
    }
}

/// A message handed out by [`WorkQueue::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Stable message ID assigned on send
    pub message_id: String,
    /// Handle for delete / extend; only valid for this delivery
    pub receipt: String,
    /// Raw body as sent
    pub body: String,
    /// Number of times the message has been delivered, this one included
    pub receive_count: u32,
}

/// Message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages waiting for a consumer
    pub visible: u64,
    /// Messages received and neither deleted nor expired
    pub in_flight: u64,
    /// Messages moved to the dead letter queue
    pub dead_lettered: u64,
}

/// Durable at-least-once channel with per-message visibility leases.
///
/// A received message is hidden from other consumers until its lease runs
/// out, after which it is delivered again unless it was deleted.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a message. Returns its message ID.
    async fn send(&self, body: &str) -> QueueResult<String>;

    /// Wait up to `wait` for one message. `None` on timeout.
    async fn receive(&self, wait: Duration) -> QueueResult<Option<ReceivedMessage>>;

    /// Remove a received message for good.
    async fn delete(&self, receipt: &str) -> QueueResult<()>;

    /// Keep a received message hidden for `lease` from now.
    async fn extend_visibility(&self, receipt: &str, lease: Duration) -> QueueResult<()>;

    /// Current message counts.
    async fn depth(&self) -> QueueResult<QueueDepth>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_config_reuses_connection() {
        let config = QueueConfig::default();
        let notify = config.notify();
        assert_eq!(notify.redis_url, config.redis_url);
        assert_eq!(notify.stream_name, "transq:notify");
        assert_eq!(notify.dlq_stream_name, "transq:notify:dlq");
    }
}
