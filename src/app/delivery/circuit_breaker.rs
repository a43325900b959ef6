use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::app::scheduling::clock::Clock;
use crate::config::delivery::DeliveryConfig;

use super::DeliveryError;

struct BreakerState {
    /// (when, failed) samples inside the rolling window.
    samples: VecDeque<(DateTime<Utc>, bool)>,
    open_until: Option<DateTime<Utc>>,
}

/// Process-scoped breaker around the delivery client. Opens when the
/// failure rate over the rolling window crosses the threshold (given a
/// minimum sample count) and fails fast for the cool-down; a fail-fast is
/// classified transient so the work is requeued, not dropped. Each process
/// protects itself independently.
pub struct CircuitBreaker {
    window: ChronoDuration,
    min_requests: usize,
    failure_rate: f64,
    cooldown: ChronoDuration,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: &DeliveryConfig, clock: Arc<dyn Clock>) -> Self {
        CircuitBreaker {
            window: ChronoDuration::from_std(config.breaker_window).unwrap_or(ChronoDuration::seconds(10)),
            min_requests: config.breaker_min_requests,
            failure_rate: config.breaker_failure_rate,
            cooldown: ChronoDuration::from_std(config.breaker_cooldown).unwrap_or(ChronoDuration::seconds(30)),
            clock,
            state: Mutex::new(BreakerState {
                samples: VecDeque::new(),
                open_until: None,
            }),
        }
    }

    /// Checked before every delivery attempt. While open, fails fast with
    /// `BreakerOpen`; once the cool-down passes, the window restarts empty
    /// so one bad burst does not instantly re-trip it.
    pub fn preflight(&self) -> Result<(), DeliveryError> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().unwrap();

        match state.open_until {
            Some(until) if now < until => Err(DeliveryError::BreakerOpen),
            Some(_) => {
                state.open_until = None;
                state.samples.clear();
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self) {
        self.record(false);
    }

    pub fn record_failure(&self) {
        self.record(true);
    }

    pub fn is_open(&self) -> bool {
        let now = self.clock.now_utc();
        let state = self.state.lock().unwrap();
        state.open_until.is_some_and(|until| now < until)
    }

    fn record(&self, failed: bool) {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().unwrap();

        state.samples.push_back((now, failed));
        let horizon = now - self.window;
        while state.samples.front().is_some_and(|(at, _)| *at < horizon) {
            state.samples.pop_front();
        }

        let total = state.samples.len();
        if total < self.min_requests {
            return;
        }
        let failures = state.samples.iter().filter(|(_, failed)| *failed).count();
        if failures as f64 / total as f64 >= self.failure_rate {
            state.open_until = Some(now + self.cooldown);
            tracing::warn!(
                failures,
                total,
                cooldown_seconds = self.cooldown.num_seconds(),
                "delivery circuit breaker opened"
            );
        }
    }
}
