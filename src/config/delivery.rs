use anyhow::Result;
use std::env;
use std::time::Duration;

use super::scheduler::duration_from_env;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Base URL of the downstream delivery provider.
    pub base_url: String,
    pub request_timeout: Duration,
    /// Exponential backoff for transient failures: base doubles per attempt
    /// up to the cap, plus jitter.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Circuit breaker: trips at `breaker_failure_rate` over the rolling
    /// `breaker_window`, once at least `breaker_min_requests` were observed.
    pub breaker_window: Duration,
    pub breaker_min_requests: usize,
    pub breaker_failure_rate: f64,
    pub breaker_cooldown: Duration,
}

impl DeliveryConfig {
    pub fn from_env() -> Result<Self> {
        Ok(DeliveryConfig {
            base_url: env::var("DELIVERY_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            request_timeout: duration_from_env("DELIVERY_REQUEST_TIMEOUT_SECONDS", 10),
            retry_base_delay: duration_from_env("DELIVERY_RETRY_BASE_DELAY_SECONDS", 1),
            retry_max_delay: duration_from_env("DELIVERY_RETRY_MAX_DELAY_SECONDS", 30),
            breaker_window: duration_from_env("DELIVERY_BREAKER_WINDOW_SECONDS", 10),
            breaker_min_requests: env::var("DELIVERY_BREAKER_MIN_REQUESTS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            breaker_failure_rate: env::var("DELIVERY_BREAKER_FAILURE_RATE")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()
                .unwrap_or(0.5),
            breaker_cooldown: duration_from_env("DELIVERY_BREAKER_COOLDOWN_SECONDS", 30),
        })
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            base_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            breaker_window: Duration::from_secs(10),
            breaker_min_requests: 10,
            breaker_failure_rate: 0.5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}
