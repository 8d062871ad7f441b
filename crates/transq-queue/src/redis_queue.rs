//! Work queue using Redis Streams.
//!
//! Each message is a stream entry read through a consumer group. The entry
//! stays in the group's pending list until it is deleted; an entry that has
//! been idle in the pending list for longer than the visibility timeout is
//! claimed again by the next `receive`. Extending visibility resets the
//! entry's idle time.
//!
//! A receipt is `<entry id>:<delivery count>`. Delete and extend check it
//! against the pending entry (owner and delivery count) inside a script, so
//! a receipt from an earlier delivery cannot touch a reclaimed entry.

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadReply,
};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::{QueueConfig, QueueDepth, ReceivedMessage, WorkQueue};

const BODY_FIELD: &str = "body";

/// KEYS: stream. ARGV: group, entry id, consumer, delivery count.
///
/// Acks and removes the entry if this delivery still owns it. Returns 1 if
/// removed, 0 otherwise.
const DELETE_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
local entry = pending[1]
if not entry or entry[2] ~= ARGV[3] or tonumber(entry[4]) ~= tonumber(ARGV[4]) then
    return 0
end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

/// KEYS: stream. ARGV: group, entry id, consumer, delivery count, idle ms.
///
/// Resets the idle time of the entry if this delivery still owns it. JUSTID
/// leaves the delivery count alone. Returns 1 if extended, 0 otherwise.
const EXTEND_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
local entry = pending[1]
if not entry or entry[2] ~= ARGV[3] or tonumber(entry[4]) ~= tonumber(ARGV[4]) then
    return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'IDLE', ARGV[5], 'JUSTID')
return 1
"#;

/// Receipt for one delivery of a stream entry.
fn encode_receipt(entry_id: &str, times_delivered: u32) -> String {
    format!("{entry_id}:{times_delivered}")
}

/// Split a receipt into entry id and delivery count.
fn parse_receipt(receipt: &str) -> QueueResult<(&str, u32)> {
    receipt
        .rsplit_once(':')
        .and_then(|(id, count)| Some((id, count.parse().ok()?)))
        .filter(|(id, _)| !id.is_empty())
        .ok_or_else(|| QueueError::invalid_receipt(receipt))
}

/// Redis Streams queue client.
pub struct RedisWorkQueue {
    client: redis::Client,
    config: QueueConfig,
    consumer_name: String,
    delete_script: Script,
    extend_script: Script,
}

impl RedisWorkQueue {
    /// Create a new queue client reading as `consumer_name`.
    pub fn new(config: QueueConfig, consumer_name: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            consumer_name: consumer_name.into(),
            delete_script: Script::new(DELETE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env(consumer_name: impl Into<String>) -> QueueResult<Self> {
        Self::new(QueueConfig::from_env(), consumer_name)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        // Start at 0 so messages sent before the first worker came up are read
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!(
                stream = %self.config.stream_name,
                "Created consumer group: {}", self.config.consumer_group
            ),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    fn visibility_ms(&self) -> u64 {
        self.config.visibility_timeout.as_millis() as u64
    }

    fn to_message(entry: &StreamId, receive_count: u32) -> ReceivedMessage {
        ReceivedMessage {
            message_id: entry.id.clone(),
            receipt: encode_receipt(&entry.id, receive_count),
            // A missing body field is surfaced as an empty body, which fails
            // to decode and gets dropped by the consumer.
            body: entry.get::<String>(BODY_FIELD).unwrap_or_default(),
            receive_count,
        }
    }

    async fn ack_and_remove(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        message_id: &str,
    ) -> QueueResult<()> {
        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(conn)
            .await?;

        Ok(())
    }

    /// Move an over-delivered message to the dead letter queue.
    async fn dead_letter(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        message_id: &str,
        times_delivered: usize,
    ) -> QueueResult<()> {
        let range: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .arg(message_id)
            .query_async(conn)
            .await?;

        let body = range
            .ids
            .first()
            .and_then(|entry| entry.get::<String>(BODY_FIELD))
            .unwrap_or_default();

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(&body)
            .arg("original_id")
            .arg(message_id)
            .arg("times_delivered")
            .arg(times_delivered)
            .query_async::<()>(conn)
            .await?;

        self.ack_and_remove(conn, message_id).await?;

        warn!(
            message_id = %message_id,
            times_delivered,
            "Moved message to DLQ after too many deliveries"
        );
        Ok(())
    }

    /// Claim one entry whose visibility lease has run out.
    async fn reclaim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> QueueResult<Option<ReceivedMessage>> {
        loop {
            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(&self.config.stream_name)
                .arg(&self.config.consumer_group)
                .arg("IDLE")
                .arg(self.visibility_ms())
                .arg("-")
                .arg("+")
                .arg(1)
                .query_async(conn)
                .await?;

            let Some(stale) = pending.ids.into_iter().next() else {
                return Ok(None);
            };

            if stale.times_delivered >= self.config.max_receives as usize {
                self.dead_letter(conn, &stale.id, stale.times_delivered)
                    .await?;
                continue;
            }

            // The min-idle argument makes this a no-op if another consumer
            // claimed the entry between XPENDING and XCLAIM.
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.config.stream_name)
                .arg(&self.config.consumer_group)
                .arg(&self.consumer_name)
                .arg(self.visibility_ms())
                .arg(&stale.id)
                .query_async(conn)
                .await?;

            return Ok(claimed.ids.first().map(|entry| {
                info!(
                    message_id = %entry.id,
                    previous_consumer = %stale.consumer,
                    "Reclaimed message after visibility timeout"
                );
                Self::to_message(entry, stale.times_delivered as u32 + 1)
            }));
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn send(&self, body: &str) -> QueueResult<String> {
        let mut conn = self.conn().await?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        debug!(stream = %self.config.stream_name, message_id = %message_id, "Sent message");
        Ok(message_id)
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<ReceivedMessage>> {
        // Blocking reads park the connection, so every call gets its own.
        let mut conn = self.conn().await?;

        if let Some(message) = self.reclaim_expired(&mut conn).await? {
            return Ok(Some(message));
        }

        // BLOCK 0 waits forever
        let block_ms = (wait.as_millis() as u64).max(1);
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::dequeue_failed(e.to_string()))?;

        let message = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
            .map(|entry| Self::to_message(&entry, 1));

        if let Some(m) = &message {
            debug!(message_id = %m.message_id, "Received message");
        }
        Ok(message)
    }

    async fn delete(&self, receipt: &str) -> QueueResult<()> {
        let (message_id, times_delivered) = parse_receipt(receipt)?;
        let mut conn = self.conn().await?;

        let removed: i32 = self
            .delete_script
            .key(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .arg(&self.consumer_name)
            .arg(times_delivered)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(QueueError::invalid_receipt(receipt));
        }
        debug!(message_id = %message_id, "Deleted message");
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &str, lease: Duration) -> QueueResult<()> {
        let (message_id, times_delivered) = parse_receipt(receipt)?;
        let mut conn = self.conn().await?;

        // Reclaim happens once idle time reaches the visibility timeout, so
        // setting idle to (timeout - lease) hides the entry for `lease` more.
        let idle_ms = self
            .visibility_ms()
            .saturating_sub(lease.as_millis() as u64);

        let extended: i32 = self
            .extend_script
            .key(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .arg(&self.consumer_name)
            .arg(times_delivered)
            .arg(idle_ms)
            .invoke_async(&mut conn)
            .await?;

        if extended == 0 {
            return Err(QueueError::invalid_receipt(receipt));
        }
        debug!(message_id = %message_id, lease_secs = lease.as_secs(), "Extended visibility");
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.conn().await?;

        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        let dead_lettered: u64 = conn.xlen(&self.config.dlq_stream_name).await?;
        let pending: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;
        let in_flight = pending.count() as u64;

        Ok(QueueDepth {
            visible: len.saturating_sub(in_flight),
            in_flight,
            dead_lettered,
        })
    }
}
