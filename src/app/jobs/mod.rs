pub mod database_queue_driver;
pub mod memory_queue_driver;
pub mod queue_worker;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::app::models::message_log::MessageLog;
use crate::app::models::DieselUlid;

pub use database_queue_driver::DatabaseQueueDriver;
pub use memory_queue_driver::MemoryQueueDriver;
pub use queue_worker::{QueueWorker, WorkerContext, WorkerStats};

/// Work item published for each enqueued log. The wire shape is the fixed
/// contract between enqueuer and worker: camelCase names, RFC 3339 UTC send
/// time, epoch-millis enqueue stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub message_id: DieselUlid,
    pub user_id: DieselUlid,
    pub message_type: String,
    pub scheduled_send_time: DateTime<Utc>,
    pub retry_count: i32,
    pub enqueued_at: i64,
}

impl WorkItem {
    pub fn for_log(log: &MessageLog, now: DateTime<Utc>) -> Self {
        WorkItem {
            message_id: log.id,
            user_id: log.user_id,
            message_type: log.message_type.clone(),
            scheduled_send_time: log.scheduled_send_time,
            retry_count: log.retry_count,
            enqueued_at: now.timestamp_millis(),
        }
    }
}

/// Name of the primary queue for a message type, e.g. `birthday_messages`.
pub fn primary_queue(message_type: &str) -> String {
    format!("{}_messages", message_type.to_lowercase())
}

/// Dead-letter companion of a primary queue.
pub fn dead_letter_queue(primary: &str) -> String {
    format!("{primary}.dlq")
}

/// A reserved queue row as handed to a consumer. The payload stays raw
/// JSON here; the worker owns parsing (and the poison path when parsing
/// fails).
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: DieselUlid,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// Durable queue contract. Publishes are acknowledged only after durable
/// acceptance; a reserved job stays invisible to other consumers until it
/// is acked, nacked, dead-lettered, or its reservation goes stale.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Durably appends a work item to `queue`.
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<()>;

    /// Reserves the next available job, or `None` when the queue is idle.
    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>>;

    /// Drops an acknowledged job for good.
    async fn ack(&self, job_id: DieselUlid) -> Result<()>;

    /// Returns a job to the queue, visible again after `delay`.
    async fn nack(&self, job_id: DieselUlid, delay: Duration) -> Result<()>;

    /// Moves a job to `dlq`, acknowledging it on the primary queue.
    async fn dead_letter(&self, job_id: DieselUlid, dlq: &str) -> Result<()>;

    /// Jobs currently waiting (not reserved) in `queue`.
    async fn size(&self, queue: &str) -> Result<u64>;

    /// Re-avails jobs whose reservation is older than `older_than` (the
    /// consumer died without acking). Returns how many were reclaimed.
    async fn reclaim_stale(&self, queue: &str, older_than: DateTime<Utc>) -> Result<u64>;

    /// Moves every job in `from` to `to` (operator DLQ drain). Returns the
    /// number moved.
    async fn drain_to(&self, from: &str, to: &str) -> Result<u64>;

    /// Deletes jobs in `queue` created before `cutoff` (DLQ hygiene).
    async fn prune(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    fn driver_name(&self) -> &'static str;
}
