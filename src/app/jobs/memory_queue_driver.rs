use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{QueueDriver, QueuedJob};
use crate::app::models::DieselUlid;
use crate::app::scheduling::clock::Clock;

#[derive(Debug, Clone)]
struct MemoryJob {
    id: DieselUlid,
    queue_name: String,
    payload: serde_json::Value,
    attempts: i32,
    available_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// In-memory queue driver for tests and local development. Mirrors the
/// database driver's reservation semantics against the injected clock.
pub struct MemoryQueueDriver {
    jobs: RwLock<HashMap<DieselUlid, MemoryJob>>,
    clock: Arc<dyn Clock>,
}

impl MemoryQueueDriver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryQueueDriver {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Snapshot of a queue's payloads, for assertions in tests.
    pub async fn payloads(&self, queue: &str) -> Vec<serde_json::Value> {
        let jobs = self.jobs.read().await;
        let mut rows: Vec<&MemoryJob> = jobs.values().filter(|j| j.queue_name == queue).collect();
        rows.sort_by_key(|j| j.created_at);
        rows.into_iter().map(|j| j.payload.clone()).collect()
    }
}

#[async_trait]
impl QueueDriver for MemoryQueueDriver {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<()> {
        let now = self.clock.now_utc();
        let job = MemoryJob {
            id: DieselUlid::new(),
            queue_name: queue.to_string(),
            payload,
            attempts: 0,
            available_at: now,
            reserved_at: None,
            created_at: now,
        };
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let now = self.clock.now_utc();
        let mut jobs = self.jobs.write().await;

        let next = jobs
            .values()
            .filter(|j| j.queue_name == queue && j.reserved_at.is_none() && j.available_at <= now)
            .min_by_key(|j| (j.available_at, j.created_at))
            .map(|j| j.id);

        let Some(id) = next else { return Ok(None) };
        let job = jobs.get_mut(&id).unwrap();
        job.reserved_at = Some(now);

        Ok(Some(QueuedJob {
            id: job.id,
            queue_name: job.queue_name.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
        }))
    }

    async fn ack(&self, job_id: DieselUlid) -> Result<()> {
        self.jobs.write().await.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: DieselUlid, delay: Duration) -> Result<()> {
        let now = self.clock.now_utc();
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.attempts += 1;
            job.reserved_at = None;
            job.available_at = now + ChronoDuration::from_std(delay)?;
        }
        Ok(())
    }

    async fn dead_letter(&self, job_id: DieselUlid, dlq: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.queue_name = dlq.to_string();
            job.reserved_at = None;
        }
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.queue_name == queue && j.reserved_at.is_none())
            .count() as u64)
    }

    async fn reclaim_stale(&self, queue: &str, older_than: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let mut reclaimed = 0;
        for job in jobs.values_mut() {
            if job.queue_name == queue && job.reserved_at.is_some_and(|at| at < older_than) {
                job.reserved_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn drain_to(&self, from: &str, to: &str) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let now = self.clock.now_utc();
        let mut moved = 0;
        for job in jobs.values_mut() {
            if job.queue_name == from {
                job.queue_name = to.to_string();
                job.reserved_at = None;
                job.available_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn prune(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.queue_name == queue && j.created_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    fn driver_name(&self) -> &'static str {
        "memory"
    }
}
