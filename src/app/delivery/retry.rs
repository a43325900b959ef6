use rand::Rng;
use std::time::Duration;

use crate::config::delivery::DeliveryConfig;

/// Exponential backoff for transient delivery failures: the base delay
/// doubles per attempt up to the cap, with up to 10% jitter so a burst of
/// failures does not come back as a burst of retries. The delay is encoded
/// in the queue redelivery time, never slept in-process.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        RetryPolicy { base, cap }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        RetryPolicy::new(config.retry_base_delay, config.retry_max_delay)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let uncapped = self.base.saturating_mul(2u32.saturating_pow(exponent));
        let capped = uncapped.min(self.cap);

        let jitter_ceiling = capped.as_millis() as u64 / 10;
        if jitter_ceiling == 0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        capped + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
