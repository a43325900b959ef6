use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::jobs::{primary_queue, QueueDriver, WorkItem};
use crate::app::models::message_log::MessageStatus;
use crate::app::scheduling::clock::Clock;
use crate::app::services::message_log_service::{MessageLogStore, StatusUpdate, StoreError};

const BATCH_LIMIT: i64 = 1_000;

/// The minute enqueuer: moves due `SCHEDULED` logs to `QUEUED` and
/// publishes their work items. The two steps are tied: a failed publish
/// rolls the status back so the next tick retries.
pub struct MinuteEnqueuer {
    store: Arc<dyn MessageLogStore>,
    queue: Arc<dyn QueueDriver>,
    clock: Arc<dyn Clock>,
    lookahead: Duration,
}

impl MinuteEnqueuer {
    pub fn new(
        store: Arc<dyn MessageLogStore>,
        queue: Arc<dyn QueueDriver>,
        clock: Arc<dyn Clock>,
        lookahead: Duration,
    ) -> Self {
        MinuteEnqueuer { store, queue, clock, lookahead }
    }

    /// One tick. Returns how many logs were enqueued.
    pub async fn run_once(&self) -> Result<u64> {
        let now = self.clock.now_utc();
        let due_by = now + chrono::Duration::from_std(self.lookahead)?;
        let due = self.store.find_scheduled_due_by(due_by, BATCH_LIMIT).await?;

        let mut enqueued = 0u64;
        for log in due {
            // Claim the log first; a competing enqueuer loses the CAS and
            // moves on without publishing a duplicate.
            let claimed = self
                .store
                .compare_and_set_status(
                    log.id,
                    MessageStatus::Scheduled,
                    MessageStatus::Queued,
                    StatusUpdate::default(),
                )
                .await;

            match claimed {
                Ok(_) => {}
                Err(StoreError::StatusConflict { .. }) | Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(message_id = %log.id, error = %e, "enqueue claim failed");
                    continue;
                }
            }

            let queue_name = primary_queue(&log.message_type);
            let item = WorkItem::for_log(&log, now);
            let payload = serde_json::to_value(&item)?;

            match self.queue.publish(&queue_name, payload).await {
                Ok(()) => {
                    enqueued += 1;
                    debug!(message_id = %log.id, queue = %queue_name, "work item published");
                }
                Err(e) => {
                    warn!(message_id = %log.id, error = %e, "publish failed, rolling back to scheduled");
                    let rollback = self
                        .store
                        .compare_and_set_status(
                            log.id,
                            MessageStatus::Queued,
                            MessageStatus::Scheduled,
                            StatusUpdate::default(),
                        )
                        .await;
                    if let Err(e) = rollback {
                        // The recovery loop will reopen it; nothing is lost,
                        // only delayed.
                        warn!(message_id = %log.id, error = %e, "rollback failed, leaving for recovery");
                    }
                }
            }
        }

        if enqueued > 0 {
            info!(enqueued, "minute enqueue finished");
        }
        Ok(enqueued)
    }
}
