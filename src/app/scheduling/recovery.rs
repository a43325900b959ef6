use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::app::models::message_log::MessageStatus;
use crate::app::scheduling::clock::Clock;
use crate::app::services::message_log_service::{MessageLogStore, StatusUpdate, StoreError};

const BATCH_LIMIT: i64 = 1_000;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoverySummary {
    pub reopened: u64,
    pub failed: u64,
}

/// The recovery loop: finds logs stuck in a non-terminal state past their
/// send time (scheduler outage, crashed worker, lost publish) and reopens
/// them to `SCHEDULED` so the minute enqueuer re-publishes. Logs that
/// already burned their retry budget are closed as `FAILED` instead. The
/// unique idempotency key means a reopened log can never become a second
/// delivery.
pub struct RecoveryLoop {
    store: Arc<dyn MessageLogStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
    max_retries: i32,
}

impl RecoveryLoop {
    pub fn new(
        store: Arc<dyn MessageLogStore>,
        clock: Arc<dyn Clock>,
        grace: Duration,
        max_retries: i32,
    ) -> Self {
        RecoveryLoop { store, clock, grace, max_retries }
    }

    pub async fn run_once(&self) -> Result<RecoverySummary> {
        let now = self.clock.now_utc();
        let cutoff = now - chrono::Duration::from_std(self.grace)?;
        let overdue = self.store.find_overdue(cutoff, BATCH_LIMIT).await?;

        let mut summary = RecoverySummary::default();
        for log in overdue {
            if log.status.is_terminal() {
                continue;
            }

            if log.retry_count >= self.max_retries {
                let update = StatusUpdate {
                    error_message: Some(format!(
                        "gave up after {} retries, {}s past schedule",
                        log.retry_count,
                        (now - log.scheduled_send_time).num_seconds()
                    )),
                    ..Default::default()
                };
                match self
                    .store
                    .compare_and_set_status(log.id, log.status, MessageStatus::Failed, update)
                    .await
                {
                    Ok(_) => {
                        summary.failed += 1;
                        warn!(message_id = %log.id, retry_count = log.retry_count, "stuck log closed as failed");
                    }
                    Err(StoreError::StatusConflict { .. }) => continue,
                    Err(e) => warn!(message_id = %log.id, error = %e, "failed to close stuck log"),
                }
                continue;
            }

            // An overdue SCHEDULED log needs no transition; the enqueuer
            // already considers it due.
            if log.status == MessageStatus::Scheduled {
                continue;
            }

            match self
                .store
                .compare_and_set_status(log.id, log.status, MessageStatus::Scheduled, StatusUpdate::default())
                .await
            {
                Ok(_) => {
                    summary.reopened += 1;
                    info!(message_id = %log.id, was = %log.status, "stuck log reopened for re-enqueue");
                }
                // Moved on by a worker in the meantime; leave it be.
                Err(StoreError::StatusConflict { .. }) => continue,
                Err(e) => warn!(message_id = %log.id, error = %e, "failed to reopen stuck log"),
            }
        }

        if summary != RecoverySummary::default() {
            info!(reopened = summary.reopened, failed = summary.failed, "recovery pass finished");
        }
        Ok(summary)
    }
}
