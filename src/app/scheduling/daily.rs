use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::models::message_log::MessageLog;
use crate::app::scheduling::clock::Clock;
use crate::app::scheduling::idempotency::IdempotencyKey;
use crate::app::scheduling::timezone::TimezoneEngine;
use crate::app::services::message_log_service::{MessageLogStore, StoreError};
use crate::app::services::user_service::UserRepository;
use crate::app::strategies::{ComposeContext, StrategyRegistry};

/// Counters from one precomputation pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DailyRunSummary {
    pub scheduled: u64,
    pub already_scheduled: u64,
    pub skipped: u64,
    pub errored: u64,
}

/// The daily precomputer: once per UTC day, walks every registered
/// strategy's candidates and inserts `SCHEDULED` logs for today's local
/// occurrences. Running it twice is harmless; the unique idempotency key
/// turns the second pass into no-ops.
pub struct DailyScheduler {
    registry: Arc<StrategyRegistry>,
    users: Arc<dyn UserRepository>,
    store: Arc<dyn MessageLogStore>,
    clock: Arc<dyn Clock>,
}

impl DailyScheduler {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        users: Arc<dyn UserRepository>,
        store: Arc<dyn MessageLogStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        DailyScheduler { registry, users, store, clock }
    }

    /// One full pass over every strategy. Per-user failures are logged and
    /// skipped; one bad record never aborts the batch.
    pub async fn run_once(&self) -> Result<DailyRunSummary> {
        let now = self.clock.now_utc();
        let mut summary = DailyRunSummary::default();

        for strategy in self.registry.iter() {
            let candidates = match self
                .users
                .find_event_candidates(strategy.trigger_field(), now)
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(
                        message_type = strategy.message_type(),
                        error = %e,
                        "candidate query failed, skipping strategy this pass"
                    );
                    summary.errored += 1;
                    continue;
                }
            };

            debug!(
                message_type = strategy.message_type(),
                candidates = candidates.len(),
                "precomputing deliveries"
            );

            for user in candidates {
                if let Err(errors) = strategy.validate(&user) {
                    warn!(user_id = %user.id, ?errors, "candidate failed validation, skipping");
                    summary.skipped += 1;
                    continue;
                }

                // validate() already vetted the zone.
                let zone = match TimezoneEngine::validate_zone(&user.timezone) {
                    Ok(zone) => zone,
                    Err(e) => {
                        warn!(user_id = %user.id, error = %e, "unresolvable zone, skipping");
                        summary.skipped += 1;
                        continue;
                    }
                };

                if !strategy.should_send(&user, zone, now) {
                    summary.skipped += 1;
                    continue;
                }

                let send_time = match strategy.calculate_send_time(&user, zone, now) {
                    Ok(send_time) => send_time,
                    Err(e) => {
                        warn!(user_id = %user.id, error = %e, "send time computation failed, skipping");
                        summary.errored += 1;
                        continue;
                    }
                };

                // The key's date is the *local* date of the occurrence, so
                // every scheduler instance derives the same key.
                let local_date = TimezoneEngine::local_date(send_time, zone);
                let key = IdempotencyKey::new(user.id, strategy.message_type(), local_date);
                let content = strategy.compose_message(&user, &ComposeContext { local_date, zone });

                let log = MessageLog::scheduled(
                    user.id,
                    strategy.message_type(),
                    content,
                    send_time,
                    &key,
                    now,
                );

                match self.store.insert(&log).await {
                    Ok(()) => {
                        summary.scheduled += 1;
                        debug!(user_id = %user.id, message_type = strategy.message_type(), send_time = %send_time, "delivery scheduled");
                    }
                    Err(StoreError::DuplicateKey(_)) => {
                        // Another scheduler (or an earlier pass) got here
                        // first; that is success, not an error.
                        summary.already_scheduled += 1;
                    }
                    Err(e) => {
                        warn!(user_id = %user.id, error = %e, "log insert failed, skipping user");
                        summary.errored += 1;
                    }
                }
            }
        }

        info!(
            scheduled = summary.scheduled,
            already_scheduled = summary.already_scheduled,
            skipped = summary.skipped,
            errored = summary.errored,
            "daily precomputation finished"
        );
        Ok(summary)
    }
}
