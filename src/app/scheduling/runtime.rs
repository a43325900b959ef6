use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::delivery::{CircuitBreaker, DeliveryClient, RetryPolicy};
use crate::app::jobs::{primary_queue, QueueDriver, QueueWorker, WorkerContext};
use crate::app::scheduling::clock::Clock;
use crate::app::scheduling::daily::DailyScheduler;
use crate::app::scheduling::enqueue::MinuteEnqueuer;
use crate::app::scheduling::recovery::RecoveryLoop;
use crate::app::services::message_log_service::MessageLogStore;
use crate::app::services::user_service::UserRepository;
use crate::app::strategies::StrategyRegistry;
use crate::config::Config;

/// The assembled delivery pipeline: daily precomputer, minute enqueuer,
/// recovery loop, and one worker pool per registered message type, all
/// sharing a cancellation token. Stages cooperate only through the store
/// and the queue; there is no shared mutable state between them.
pub struct Pipeline {
    registry: Arc<StrategyRegistry>,
    queue: Arc<dyn QueueDriver>,
    clock: Arc<dyn Clock>,
    daily: Arc<DailyScheduler>,
    enqueuer: Arc<MinuteEnqueuer>,
    recovery: Arc<RecoveryLoop>,
    worker_ctx: Arc<WorkerContext>,
    config: Config,
}

impl Pipeline {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        users: Arc<dyn UserRepository>,
        store: Arc<dyn MessageLogStore>,
        queue: Arc<dyn QueueDriver>,
        delivery: Arc<dyn DeliveryClient>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        let daily = Arc::new(DailyScheduler::new(
            registry.clone(),
            users.clone(),
            store.clone(),
            clock.clone(),
        ));
        let enqueuer = Arc::new(MinuteEnqueuer::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            config.scheduler.enqueue_lookahead,
        ));
        let recovery = Arc::new(RecoveryLoop::new(
            store.clone(),
            clock.clone(),
            config.scheduler.recovery_grace,
            config.scheduler.max_retries,
        ));
        let worker_ctx = Arc::new(WorkerContext {
            store: store.clone(),
            users,
            queue: queue.clone(),
            delivery,
            breaker: Arc::new(CircuitBreaker::new(&config.delivery, clock.clone())),
            retry: RetryPolicy::from_config(&config.delivery),
            clock: clock.clone(),
            max_retries: config.scheduler.max_retries,
        });

        Pipeline {
            registry,
            queue,
            clock,
            daily,
            enqueuer,
            recovery,
            worker_ctx,
            config,
        }
    }

    /// Runs all stages until the token is cancelled, then drains workers
    /// within their grace window.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        // Daily precomputer: one catch-up pass now (idempotent), then at
        // every 00:00 UTC.
        {
            let daily = self.daily.clone();
            let clock = self.clock.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = daily.run_once().await {
                    error!(error = %e, "daily precomputation failed");
                }
                loop {
                    let pause = until_next_utc_midnight(clock.now_utc());
                    tokio::select! {
                        _ = sleep(pause) => {}
                        _ = cancel.cancelled() => break,
                    }
                    if let Err(e) = daily.run_once().await {
                        error!(error = %e, "daily precomputation failed");
                    }
                }
            });
        }

        // Minute enqueuer.
        {
            let enqueuer = self.enqueuer.clone();
            let interval = self.config.scheduler.enqueue_interval;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                run_periodic("minute enqueue", interval, cancel, move || {
                    let enqueuer = enqueuer.clone();
                    async move { enqueuer.run_once().await.map(|_| ()) }
                })
                .await;
            });
        }

        // Recovery loop, which also reclaims stale queue reservations.
        {
            let recovery = self.recovery.clone();
            let queue = self.queue.clone();
            let clock = self.clock.clone();
            let queues: Vec<String> = self
                .registry
                .iter()
                .map(|s| primary_queue(s.message_type()))
                .collect();
            let visibility = self.config.worker.visibility_timeout;
            let interval = self.config.scheduler.recovery_interval;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                run_periodic("recovery", interval, cancel, move || {
                    let recovery = recovery.clone();
                    let queue = queue.clone();
                    let clock = clock.clone();
                    let queues = queues.clone();
                    async move {
                        recovery.run_once().await?;
                        let stale_before =
                            clock.now_utc() - chrono::Duration::from_std(visibility)?;
                        for name in &queues {
                            let reclaimed = queue.reclaim_stale(name, stale_before).await?;
                            if reclaimed > 0 {
                                info!(queue = %name, reclaimed, "reclaimed stale reservations");
                            }
                        }
                        Ok(())
                    }
                })
                .await;
            });
        }

        // One worker pool per registered message type.
        for strategy in self.registry.iter() {
            let worker = QueueWorker::new(
                primary_queue(strategy.message_type()),
                self.config.worker.clone(),
                self.worker_ctx.clone(),
            );
            let cancel = cancel.clone();
            tasks.spawn(async move {
                worker.run(cancel).await;
            });
        }

        info!(
            strategies = self.registry.len(),
            "delivery pipeline running"
        );

        while tasks.join_next().await.is_some() {}
        info!("delivery pipeline stopped");
    }
}

/// Fixed-cadence loop shared by the enqueuer and recovery stages. A
/// failing pass is logged and retried on the next tick, never fatal.
async fn run_periodic<F, Fut>(name: &'static str, every: Duration, cancel: CancellationToken, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = pass().await {
                    error!(loop_name = name, error = %e, "pass failed");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

fn until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let next_midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(now + chrono::Duration::days(1));
    (next_midnight - now).to_std().unwrap_or(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn midnight_pause_spans_to_the_next_utc_day() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 23, 59, 0).unwrap();
        assert_eq!(until_next_utc_midnight(now), Duration::from_secs(60));

        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(until_next_utc_midnight(now), Duration::from_secs(86_400));
    }
}
