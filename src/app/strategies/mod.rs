pub mod anniversary;
pub mod birthday;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;

use crate::app::models::User;
use crate::app::scheduling::timezone::{InvalidTimeSpec, TimezoneEngine};

pub use anniversary::AnniversaryStrategy;
pub use birthday::BirthdayStrategy;

/// How often a message type fires for a given user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Yearly,
    Once,
}

/// Static description of when a message type goes out.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleDescriptor {
    pub cadence: Cadence,
    pub send_hour_local: u32,
    pub send_minute_local: u32,
}

impl ScheduleDescriptor {
    /// The yearly 09:00-local contract shared by all greeting types.
    pub fn yearly_morning() -> Self {
        ScheduleDescriptor {
            cadence: Cadence::Yearly,
            send_hour_local: 9,
            send_minute_local: 0,
        }
    }
}

/// Context handed to composers: the occurrence being composed for, never
/// "now" (composition must be deterministic across retries).
#[derive(Debug, Clone)]
pub struct ComposeContext {
    pub local_date: NaiveDate,
    pub zone: Tz,
}

/// One yearly-cadence message type. Implementations supply the trigger
/// field and the message text; candidate matching and send-time math come
/// from the default methods so a new event type only has to fill in the
/// parts that differ.
pub trait MessageStrategy: Send + Sync {
    /// Registry key, stored on every log row (e.g. "BIRTHDAY").
    fn message_type(&self) -> &'static str;

    /// Name of the user field this strategy consults.
    fn trigger_field(&self) -> &'static str;

    fn schedule(&self) -> ScheduleDescriptor {
        ScheduleDescriptor::yearly_morning()
    }

    /// Renders the delivered text. Pure; any year arithmetic uses the
    /// occurrence date from the context.
    fn compose_message(&self, user: &User, ctx: &ComposeContext) -> String;

    /// Whether this user should receive the message on `local_date`
    /// (their local today). Defaults to "the trigger field matches today",
    /// honoring the Feb 29 -> Feb 28 fallback.
    fn should_send(&self, user: &User, zone: Tz, now: DateTime<Utc>) -> bool {
        match user.event_date(self.trigger_field()) {
            Some(event) => TimezoneEngine::is_event_today(event, zone, now),
            None => false,
        }
    }

    /// The UTC instant of this year's occurrence at the descriptor's local
    /// wall-clock time in the user's zone.
    fn calculate_send_time(
        &self,
        user: &User,
        zone: Tz,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, InvalidTimeSpec> {
        let event = user
            .event_date(self.trigger_field())
            .ok_or(InvalidTimeSpec::MissingEventDate(self.trigger_field()))?;
        let descriptor = self.schedule();
        TimezoneEngine::calculate_send_time(
            event,
            zone,
            now,
            descriptor.send_hour_local,
            descriptor.send_minute_local,
        )
    }

    /// Checks the user record carries everything this strategy needs.
    fn validate(&self, user: &User) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if user.event_date(self.trigger_field()).is_none() {
            errors.push(format!("user {} has no {}", user.id, self.trigger_field()));
        }
        if TimezoneEngine::validate_zone(&user.timezone).is_err() {
            errors.push(format!("user {} has invalid timezone {:?}", user.id, user.timezone));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Process-wide map from message type to strategy. Built once at startup
/// and read-only afterwards; re-registering a key replaces the previous
/// value, which is the supported way to override a built-in.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn MessageStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        StrategyRegistry { strategies: HashMap::new() }
    }

    /// Registry with the built-in greeting types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BirthdayStrategy));
        registry.register(Arc::new(AnniversaryStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn MessageStrategy>) {
        let key = strategy.message_type();
        if self.strategies.insert(key, strategy).is_some() {
            tracing::debug!(message_type = key, "strategy replaced in registry");
        }
    }

    pub fn get(&self, message_type: &str) -> Option<&Arc<dyn MessageStrategy>> {
        self.strategies.get(message_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn MessageStrategy>> {
        self.strategies.values()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Years elapsed since the event's original year, for composers that speak
/// of "Nth anniversary".
pub(crate) fn years_since(event: NaiveDate, occurrence: NaiveDate) -> i32 {
    occurrence.year() - event.year()
}
