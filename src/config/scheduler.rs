use anyhow::Result;
use std::env;
use std::time::Duration;

/// Knobs for the three scheduling loops. Durations come from env vars in
/// seconds so deployments can tighten them without a rebuild.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Added to "now" by the minute enqueuer to absorb tick jitter.
    pub enqueue_lookahead: Duration,
    /// Cadence of the minute enqueuer.
    pub enqueue_interval: Duration,
    /// Cadence of the recovery loop.
    pub recovery_interval: Duration,
    /// How far past its send time a non-terminal log must be before the
    /// recovery loop considers it stuck.
    pub recovery_grace: Duration,
    pub max_retries: i32,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(SchedulerConfig {
            enqueue_lookahead: duration_from_env("SCHEDULER_LOOKAHEAD_SECONDS", 60),
            enqueue_interval: duration_from_env("SCHEDULER_ENQUEUE_INTERVAL_SECONDS", 60),
            recovery_interval: duration_from_env("SCHEDULER_RECOVERY_INTERVAL_SECONDS", 900),
            recovery_grace: duration_from_env("SCHEDULER_RECOVERY_GRACE_SECONDS", 300),
            max_retries: env::var("SCHEDULER_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
        })
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enqueue_lookahead: Duration::from_secs(60),
            enqueue_interval: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(900),
            recovery_grace: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

pub(crate) fn duration_from_env(key: &str, default_seconds: u64) -> Duration {
    let seconds = env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_seconds);
    Duration::from_secs(seconds)
}
