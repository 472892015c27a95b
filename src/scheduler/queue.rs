//! Message queues used between the control plane, router and workers.
//!
//! `MessageQueue` is the seam every component talks to. `RedisQueue` is the
//! production implementation and uses three Redis lists per queue:
//!
//! - `{queue_name}`: messages waiting for delivery
//! - `{queue_name}:processing`: messages handed to a consumer but not yet acknowledged
//! - `{queue_name}:dead_letter`: messages that exhausted their attempts or can never succeed
//!
//! Delivery moves a message atomically into the processing list with
//! BRPOPLPUSH and records a lease for it in the `{queue_name}:leases` hash
//! (envelope id to deadline in unix seconds). Recovery only returns entries
//! whose lease has expired, so messages held by live consumers sharing the
//! processing list are never delivered twice.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::message::Envelope;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The queue refused the message.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// A FIFO queue of opaque JSON messages with at-least-once delivery.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Name of the queue, used in logs and metrics.
    fn name(&self) -> &str;

    /// Appends a message.
    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Waits up to `wait` for the next message.
    async fn receive(&self, wait: Duration) -> Result<Option<Envelope>, QueueError>;

    /// Acknowledges a delivered message so it is never redelivered.
    async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError>;

    /// Returns a delivered message to the queue for another attempt.
    async fn requeue(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Moves a delivered message to the dead-letter list.
    async fn dead_letter(&self, envelope: Envelope, reason: &str) -> Result<(), QueueError>;

    /// Number of messages waiting for delivery. May lag behind reality.
    async fn approximate_backlog(&self) -> Result<usize, QueueError>;

    /// Number of delivered messages not yet acknowledged.
    async fn in_flight(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    /// Returns messages stranded by crashed consumers to the queue.
    /// Queues without delivery tracking have nothing to recover.
    async fn recover_unacknowledged(&self) -> Result<usize, QueueError> {
        Ok(0)
    }
}

/// Serializes `payload` and publishes it with the given attempt budget.
pub async fn publish_payload<T: Serialize + Sync>(
    queue: &dyn MessageQueue,
    payload: &T,
    max_attempts: u32,
) -> Result<Uuid, QueueError> {
    let envelope = Envelope::from_payload(payload)?.with_max_attempts(max_attempts);
    let id = envelope.id;
    queue.publish(envelope).await?;
    Ok(id)
}

/// Entry stored in the dead-letter list.
pub fn dead_letter_entry(envelope: &Envelope, reason: &str) -> serde_json::Value {
    serde_json::json!({
        "message": envelope,
        "error": reason,
        "moved_at": chrono::Utc::now().to_rfc3339(),
    })
}

/// Dead-letter entry for a processing-list item that is not an envelope.
pub fn raw_dead_letter_entry(raw: &str, reason: &str) -> serde_json::Value {
    serde_json::json!({
        "raw": raw,
        "error": reason,
        "moved_at": chrono::Utc::now().to_rfc3339(),
    })
}

/// State of a processing-list entry's lease at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// A consumer holds the entry until the deadline.
    Held,
    /// No lease recorded, e.g. the consumer died between delivery and leasing.
    Unleased,
    Expired,
}

impl LeaseState {
    pub fn at(deadline: Option<i64>, now: i64) -> Self {
        match deadline {
            Some(deadline) if deadline > now => LeaseState::Held,
            Some(_) => LeaseState::Expired,
            None => LeaseState::Unleased,
        }
    }
}

/// Moves one entry out of the processing list only if it is still there.
///
/// KEYS: processing list, destination list, lease hash.
/// ARGV: entry as stored, entry to push, envelope id, `RPUSH` or `LPUSH`.
const MOVE_ENTRY_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call(ARGV[4], KEYS[2], ARGV[2])
    redis.call('HDEL', KEYS[3], ARGV[3])
    return 1
end
return 0
"#;

/// Default time a consumer may hold a delivered message before recovery
/// considers it abandoned.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(3600);

/// Redis-backed queue with reliable delivery.
pub struct RedisQueue {
    redis: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    dead_letter_queue: String,
    lease_hash: String,
    lease: Duration,
}

impl RedisQueue {
    /// Connects to Redis and opens the queue `queue_name`.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Opens a queue on an existing connection, so several queues can share it.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
            lease_hash: format!("{}:leases", queue_name),
            lease: DEFAULT_LEASE,
        }
    }

    /// Sets how long a delivered message stays leased to its consumer.
    /// Should exceed the longest time a consumer spends on one message.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lease_deadline(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.lease.as_secs() as i64
    }

    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.processing_queue).await?;
        Ok(len)
    }

    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.dead_letter_queue).await?;
        Ok(len)
    }

    /// Moves messages whose lease expired back onto the queue, or to the
    /// dead-letter list once out of attempts. Entries that cannot be decoded
    /// are dead-lettered as they are.
    ///
    /// Returns the number of messages requeued.
    pub async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let now = chrono::Utc::now().timestamp();
        let mut recovered = 0;

        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for data in entries {
            let mut envelope = match serde_json::from_str::<Envelope>(&data) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.dead_letter_raw(&data, &e.to_string()).await?;
                    continue;
                }
            };
            let id = envelope.id.to_string();

            let deadline: Option<i64> = conn.hget(&self.lease_hash, &id).await?;
            match LeaseState::at(deadline, now) {
                LeaseState::Held => continue,
                LeaseState::Unleased => {
                    conn.hset_nx::<_, _, _, ()>(&self.lease_hash, &id, self.lease_deadline())
                        .await?;
                    continue;
                }
                LeaseState::Expired => {}
            }

            envelope.increment_attempts();
            let moved = if envelope.should_retry() {
                let serialized = serde_json::to_string(&envelope)?;
                self.move_entry(&data, &self.queue_name, &serialized, &id, "RPUSH")
                    .await?
            } else {
                let entry = dead_letter_entry(
                    &envelope,
                    "Recovered from processing list after max attempts",
                );
                let serialized = serde_json::to_string(&entry)?;
                self.move_entry(&data, &self.dead_letter_queue, &serialized, &id, "LPUSH")
                    .await?;
                false
            };

            if moved {
                warn!(
                    queue = %self.queue_name,
                    message_id = %id,
                    attempts = envelope.attempts,
                    "Requeued message with expired lease"
                );
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Runs [`MOVE_ENTRY_SCRIPT`]; returns whether the entry was still in
    /// the processing list.
    async fn move_entry(
        &self,
        stored: &str,
        destination: &str,
        pushed: &str,
        id: &str,
        push_command: &str,
    ) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let moved: i64 = redis::Script::new(MOVE_ENTRY_SCRIPT)
            .key(&self.processing_queue)
            .key(destination)
            .key(&self.lease_hash)
            .arg(stored)
            .arg(pushed)
            .arg(id)
            .arg(push_command)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn dead_letter_raw(&self, data: &str, reason: &str) -> Result<(), QueueError> {
        warn!(
            queue = %self.queue_name,
            error = %reason,
            "Dead-lettering undecodable processing entry"
        );
        let serialized = serde_json::to_string(&raw_dead_letter_entry(data, reason))?;
        self.move_entry(data, &self.dead_letter_queue, &serialized, "", "LPUSH")
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, processing, dead_letter) = tokio::try_join!(
            self.approximate_backlog(),
            self.processing_len(),
            self.dead_letter_len()
        )?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_messages: pending,
            processing_messages: processing,
            dead_letter_messages: dead_letter,
        })
    }

    /// Reads up to `limit` dead-letter entries without removing them.
    pub async fn peek_dead_letter(
        &self,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }

    async fn remove_from_processing(&self, id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for data in entries {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&data) {
                if envelope.id == id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &data)
                        .await?;
                    break;
                }
            }
        }

        // The entry may already be gone after recovery; the lease goes either way.
        conn.hdel::<_, _, ()>(&self.lease_hash, id.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Envelope>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = wait.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(data) = result else {
            return Ok(None);
        };

        let envelope: Envelope = match serde_json::from_str(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.dead_letter_raw(&data, &e.to_string()).await?;
                return Ok(None);
            }
        };

        conn.hset::<_, _, _, ()>(&self.lease_hash, envelope.id.to_string(), self.lease_deadline())
            .await?;
        Ok(Some(envelope))
    }

    async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.remove_from_processing(envelope.id).await
    }

    async fn requeue(&self, envelope: Envelope) -> Result<(), QueueError> {
        self.remove_from_processing(envelope.id).await?;

        // Right end is the head of the queue, so the retry is delivered next.
        let serialized = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    async fn dead_letter(&self, envelope: Envelope, reason: &str) -> Result<(), QueueError> {
        self.remove_from_processing(envelope.id).await?;

        let serialized = serde_json::to_string(&dead_letter_entry(&envelope, reason))?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;
        Ok(())
    }

    async fn approximate_backlog(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }

    async fn in_flight(&self) -> Result<usize, QueueError> {
        self.processing_len().await
    }

    async fn recover_unacknowledged(&self) -> Result<usize, QueueError> {
        self.recover_processing().await
    }
}

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_name: String,
    pub pending_messages: usize,
    pub processing_messages: usize,
    pub dead_letter_messages: usize,
}

impl QueueStats {
    pub fn total_messages(&self) -> usize {
        self.pending_messages + self.processing_messages + self.dead_letter_messages
    }
}
