//! Redis-backed FIFO queue for notification events.
//!
//! Failure policy is asymmetric: enqueue errors propagate to the producer
//! (event loss must be visible), dequeue errors degrade to "no message" so a
//! broken payload or a Redis hiccup never halts a listener loop.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use herald_common::error::AppError;
use herald_common::types::NotificationEvent;

/// FIFO transport for notification events over a Redis list.
///
/// Events are appended to the tail with `RPUSH` and popped from the head with
/// `BLPOP`, so delivery is FIFO-at-enqueue. There is no acknowledgment or
/// redelivery: consumption is at-most-once.
#[derive(Clone)]
pub struct NotificationQueue {
    redis: ConnectionManager,
    key: String,
    pop_timeout: Duration,
}

impl NotificationQueue {
    pub fn new(redis: ConnectionManager, key: impl Into<String>, pop_timeout: Duration) -> Self {
        Self {
            redis,
            key: key.into(),
            pop_timeout,
        }
    }

    /// Append an event to the tail of the queue.
    pub async fn enqueue(&self, event: &NotificationEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(&self.key, payload).await?;

        tracing::debug!(
            user_id = %event.user_id,
            notification_type = %event.notification_type,
            "Notification event enqueued"
        );
        Ok(())
    }

    /// Blocking pop from the head of the queue, bounded by the pop timeout.
    ///
    /// Returns `None` on timeout, on Redis errors and on undecodable payloads.
    pub async fn dequeue(&self) -> Option<NotificationEvent> {
        let mut conn = self.redis.clone();

        // BLPOP replies (key, value), or nil on timeout
        let reply: Option<(String, String)> = match redis::cmd("BLPOP")
            .arg(&self.key)
            .arg(self.pop_timeout.as_secs())
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Queue read failed, treating as empty");
                // don't hot-loop against a down Redis
                tokio::time::sleep(self.pop_timeout).await;
                return None;
            }
        };

        let (_, payload) = reply?;
        match serde_json::from_str(&payload) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable queue payload");
                None
            }
        }
    }

    /// Approximate queue length, for observability only.
    pub async fn len(&self) -> u64 {
        let mut conn = self.redis.clone();
        match conn.llen::<_, u64>(&self.key).await {
            Ok(len) => len,
            Err(e) => {
                tracing::debug!(error = %e, "Queue length unavailable");
                0
            }
        }
    }

    pub fn pop_timeout(&self) -> Duration {
        self.pop_timeout
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
