use anyhow::Result;
use std::env;
use std::time::Duration;

use super::scheduler::duration_from_env;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumers per queue.
    pub concurrency: usize,
    /// In-flight items each consumer may hold. With prefetch 1 items are
    /// processed in approximately delivery order; order is never a contract.
    pub prefetch: usize,
    /// How long an idle consumer sleeps before polling again.
    pub poll_interval: Duration,
    /// Grace window for in-flight work on shutdown; beyond it the queue
    /// redelivers whatever was not acknowledged.
    pub shutdown_grace: Duration,
    /// Reservations older than this are considered abandoned and reclaimed.
    pub visibility_timeout: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(WorkerConfig {
            concurrency: env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .unwrap_or(4),
            prefetch: env::var("WORKER_PREFETCH")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            poll_interval: duration_from_env("WORKER_POLL_INTERVAL_SECONDS", 1),
            shutdown_grace: duration_from_env("WORKER_SHUTDOWN_GRACE_SECONDS", 30),
            visibility_timeout: duration_from_env("WORKER_VISIBILITY_TIMEOUT_SECONDS", 120),
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            concurrency: 4,
            prefetch: 5,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(120),
        }
    }
}
