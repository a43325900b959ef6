use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::delivery::classifier::{classify, Outcome};
use crate::app::delivery::{CircuitBreaker, DeliveryClient, DeliveryRequest, RetryPolicy};
use crate::app::models::message_log::{MessageLog, MessageStatus};
use crate::app::scheduling::clock::Clock;
use crate::app::services::message_log_service::{MessageLogStore, StatusUpdate, StoreError};
use crate::app::services::user_service::UserRepository;
use crate::config::worker::WorkerConfig;

use super::{dead_letter_queue, QueueDriver, QueuedJob, WorkItem};

/// Everything a consumer needs, shared across the pool.
pub struct WorkerContext {
    pub store: Arc<dyn MessageLogStore>,
    pub users: Arc<dyn UserRepository>,
    pub queue: Arc<dyn QueueDriver>,
    pub delivery: Arc<dyn DeliveryClient>,
    pub breaker: Arc<CircuitBreaker>,
    pub retry: RetryPolicy,
    pub clock: Arc<dyn Clock>,
    pub max_retries: i32,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

/// Consumer pool for one primary queue. Each consumer keeps up to
/// `prefetch` deliveries in flight; the pool drains in-flight work on
/// cancellation and lets the queue redeliver whatever missed the grace
/// window.
pub struct QueueWorker {
    queue_name: String,
    dlq_name: String,
    config: WorkerConfig,
    ctx: Arc<WorkerContext>,
    stats: Arc<RwLock<WorkerStats>>,
}

impl QueueWorker {
    pub fn new(queue_name: String, config: WorkerConfig, ctx: Arc<WorkerContext>) -> Self {
        let dlq_name = dead_letter_queue(&queue_name);
        QueueWorker {
            queue_name,
            dlq_name,
            config,
            ctx,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
        }
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Runs the pool until `cancel` fires, then drains.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            queue = %self.queue_name,
            concurrency = self.config.concurrency,
            prefetch = self.config.prefetch,
            "queue worker starting"
        );

        let mut consumers = JoinSet::new();
        for consumer_id in 0..self.config.concurrency {
            let ctx = self.ctx.clone();
            let config = self.config.clone();
            let queue_name = self.queue_name.clone();
            let dlq_name = self.dlq_name.clone();
            let stats = self.stats.clone();
            let cancel = cancel.clone();
            consumers.spawn(async move {
                run_consumer(consumer_id, ctx, config, queue_name, dlq_name, stats, cancel).await;
            });
        }

        let stats_task = self.spawn_stats_task(cancel.clone());

        while consumers.join_next().await.is_some() {}
        stats_task.abort();

        info!(queue = %self.queue_name, "queue worker stopped");
    }

    fn spawn_stats_task(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let queue_name = self.queue_name.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let s = stats.read().await.clone();
                        info!(
                            queue = %queue_name,
                            processed = s.processed,
                            sent = s.sent,
                            retried = s.retried,
                            failed = s.failed,
                            dead_lettered = s.dead_lettered,
                            "worker stats"
                        );
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

async fn run_consumer(
    consumer_id: usize,
    ctx: Arc<WorkerContext>,
    config: WorkerConfig,
    queue_name: String,
    dlq_name: String,
    stats: Arc<RwLock<WorkerStats>>,
    cancel: CancellationToken,
) {
    debug!(queue = %queue_name, consumer_id, "consumer started");
    let mut in_flight: JoinSet<()> = JoinSet::new();

    while !cancel.is_cancelled() {
        while in_flight.try_join_next().is_some() {}

        if in_flight.len() >= config.prefetch {
            tokio::select! {
                _ = in_flight.join_next() => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        }

        match ctx.queue.pop(&queue_name).await {
            Ok(Some(job)) => {
                let ctx = ctx.clone();
                let dlq_name = dlq_name.clone();
                let stats = stats.clone();
                in_flight.spawn(async move {
                    process_delivery(ctx, job, dlq_name, stats).await;
                });
            }
            Ok(None) => {
                tokio::select! {
                    _ = sleep(config.poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Err(e) => {
                error!(queue = %queue_name, consumer_id, error = %e, "queue pop failed");
                tokio::select! {
                    _ = sleep(config.poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    // Shutdown: stop accepting, finish in-flight work within the grace
    // window. Anything aborted stays reserved until the queue reclaims it.
    let drain = async {
        while in_flight.join_next().await.is_some() {}
    };
    if timeout(config.shutdown_grace, drain).await.is_err() {
        warn!(queue = %queue_name, consumer_id, "grace window elapsed, abandoning in-flight work");
    }
    debug!(queue = %queue_name, consumer_id, "consumer stopped");
}

async fn process_delivery(
    ctx: Arc<WorkerContext>,
    job: QueuedJob,
    dlq_name: String,
    stats: Arc<RwLock<WorkerStats>>,
) {
    stats.write().await.processed += 1;

    // A payload that does not parse is poison: there is no log to update,
    // only a queue row to get out of the way.
    let item: WorkItem = match serde_json::from_value(job.payload.clone()) {
        Ok(item) => item,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "poison payload, dead-lettering");
            if let Err(e) = ctx.queue.dead_letter(job.id, &dlq_name).await {
                error!(job_id = %job.id, error = %e, "failed to dead-letter poison payload");
            }
            stats.write().await.dead_lettered += 1;
            return;
        }
    };

    if let Err(e) = handle_item(&ctx, &job, &item, &dlq_name, &stats).await {
        error!(job_id = %job.id, message_id = %item.message_id, error = %e, "delivery handling failed");
        let delay = ctx.retry.delay_for_attempt(job.attempts + 1);
        if let Err(e) = ctx.queue.nack(job.id, delay).await {
            error!(job_id = %job.id, error = %e, "failed to nack after handler error");
        }
    }
}

async fn handle_item(
    ctx: &Arc<WorkerContext>,
    job: &QueuedJob,
    item: &WorkItem,
    dlq_name: &str,
    stats: &Arc<RwLock<WorkerStats>>,
) -> Result<()> {
    let Some(log) = ctx.store.find_by_id(item.message_id).await? else {
        warn!(message_id = %item.message_id, "work item references no log, dead-lettering");
        ctx.queue.dead_letter(job.id, dlq_name).await?;
        stats.write().await.dead_lettered += 1;
        return Ok(());
    };

    // The crash-safety hinge: a redelivered item for an already-terminal
    // log is acknowledged without touching the delivery client.
    match log.status {
        MessageStatus::Sent | MessageStatus::Failed => {
            debug!(message_id = %log.id, status = %log.status, "log already terminal, acknowledging");
            ctx.queue.ack(job.id).await?;
            return Ok(());
        }
        // Recovery reopened the log (a fresh item will be published) or
        // another consumer is mid-delivery. Either way this item is stale.
        MessageStatus::Scheduled | MessageStatus::Sending => {
            debug!(message_id = %log.id, status = %log.status, "stale work item, acknowledging");
            ctx.queue.ack(job.id).await?;
            return Ok(());
        }
        MessageStatus::Retrying => {
            // Redelivery after a transient failure.
            if !pickup_transition(ctx, job, &log, MessageStatus::Retrying, MessageStatus::Queued).await? {
                return Ok(());
            }
        }
        MessageStatus::Queued => {}
    }

    if !pickup_transition(ctx, job, &log, MessageStatus::Queued, MessageStatus::Sending).await? {
        return Ok(());
    }
    let log = ctx
        .store
        .find_by_id(log.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("log {} vanished mid-delivery", log.id))?;

    let outcome = attempt_delivery(ctx, &log).await?;
    let now = ctx.clock.now_utc();

    match outcome {
        Outcome::Sent { status_code, body } => {
            let update = StatusUpdate {
                actual_send_time: Some(now),
                api_response_code: Some(status_code as i32),
                api_response_body: body,
                ..Default::default()
            };
            finish_transition(ctx, log.id, MessageStatus::Sent, update).await?;
            ctx.queue.ack(job.id).await?;
            stats.write().await.sent += 1;
            info!(message_id = %log.id, message_type = %log.message_type, "message sent");
        }
        Outcome::Transient { status_code, reason } => {
            let attempt = log.retry_count + 1;
            let update = StatusUpdate {
                retry_count: Some(attempt),
                last_retry_at: Some(now),
                api_response_code: status_code.map(|c| c as i32),
                error_message: Some(reason.clone()),
                ..Default::default()
            };

            if attempt >= ctx.max_retries {
                finish_transition(ctx, log.id, MessageStatus::Failed, update).await?;
                ctx.queue.dead_letter(job.id, dlq_name).await?;
                stats.write().await.failed += 1;
                warn!(
                    message_id = %log.id,
                    attempt,
                    reason = %reason,
                    "retry budget exhausted, dead-lettered"
                );
            } else {
                finish_transition(ctx, log.id, MessageStatus::Retrying, update).await?;
                let delay = ctx.retry.delay_for_attempt(attempt);
                ctx.queue.nack(job.id, delay).await?;
                stats.write().await.retried += 1;
                debug!(message_id = %log.id, attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "transient failure, requeued");
            }
        }
        Outcome::Permanent { status_code, reason } => {
            let update = StatusUpdate {
                api_response_code: status_code.map(|c| c as i32),
                error_message: Some(reason.clone()),
                ..Default::default()
            };
            finish_transition(ctx, log.id, MessageStatus::Failed, update).await?;
            ctx.queue.dead_letter(job.id, dlq_name).await?;
            stats.write().await.failed += 1;
            warn!(message_id = %log.id, reason = %reason, "permanent failure, dead-lettered");
        }
    }

    Ok(())
}

/// One call against the delivery client, behind the circuit breaker.
/// Breaker fail-fast skips the call and classifies as transient so the
/// item is requeued rather than dropped.
async fn attempt_delivery(ctx: &Arc<WorkerContext>, log: &MessageLog) -> Result<Outcome> {
    let Some(user) = ctx.users.find_by_id(log.user_id).await? else {
        return Ok(Outcome::Permanent {
            status_code: None,
            reason: format!("user {} not found", log.user_id),
        });
    };

    if let Err(e) = ctx.breaker.preflight() {
        return Ok(classify(Err(e)));
    }

    let request = DeliveryRequest {
        to: user.email,
        content: log.message_content.clone(),
        idempotency_key: log.idempotency_key.clone(),
    };
    let outcome = classify(ctx.delivery.send(&request).await);

    if outcome.is_transient() {
        ctx.breaker.record_failure();
    } else {
        ctx.breaker.record_success();
    }

    Ok(outcome)
}

/// Compare-and-set for worker pick-up. Returns false (after settling the
/// queue item) when another actor moved the log first.
async fn pickup_transition(
    ctx: &Arc<WorkerContext>,
    job: &QueuedJob,
    log: &MessageLog,
    from: MessageStatus,
    to: MessageStatus,
) -> Result<bool> {
    match ctx
        .store
        .compare_and_set_status(log.id, from, to, StatusUpdate::default())
        .await
    {
        Ok(_) => Ok(true),
        Err(StoreError::StatusConflict { found, .. }) => {
            if found.is_some_and(|s| s.is_terminal()) {
                ctx.queue.ack(job.id).await?;
            } else {
                // Someone else owns it right now; let redelivery sort it out.
                ctx.queue.nack(job.id, Duration::from_secs(5)).await?;
            }
            Ok(false)
        }
        Err(StoreError::NotFound(_)) => {
            ctx.queue.ack(job.id).await?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Post-delivery transition out of SENDING. A conflict here means the
/// recovery loop intervened mid-flight; re-read and leave terminal rows
/// alone (the delivery provider deduplicates on the idempotency key).
async fn finish_transition(
    ctx: &Arc<WorkerContext>,
    id: crate::app::models::DieselUlid,
    to: MessageStatus,
    update: StatusUpdate,
) -> Result<()> {
    match ctx
        .store
        .compare_and_set_status(id, MessageStatus::Sending, to, update)
        .await
    {
        Ok(_) => Ok(()),
        Err(StoreError::StatusConflict { found, .. }) => {
            warn!(message_id = %id, ?found, target = %to, "status moved mid-delivery, leaving as-is");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::delivery::{DeliveryError, DeliveryResponse, MockDeliveryClient};
    use crate::app::jobs::{primary_queue, MemoryQueueDriver};
    use crate::app::models::user::User;
    use crate::app::scheduling::clock::ManualClock;
    use crate::app::scheduling::idempotency::IdempotencyKey;
    use crate::app::services::message_log_service::MemoryMessageLogStore;
    use crate::app::services::user_service::MemoryUserRepository;
    use crate::config::delivery::DeliveryConfig;
    use chrono::{NaiveDate, TimeZone, Utc};

    struct Fixture {
        ctx: Arc<WorkerContext>,
        store: Arc<MemoryMessageLogStore>,
        queue: Arc<MemoryQueueDriver>,
        clock: Arc<ManualClock>,
        user: User,
    }

    async fn fixture(delivery: MockDeliveryClient, max_retries: i32) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryMessageLogStore::new());
        let queue = Arc::new(MemoryQueueDriver::new(clock.clone()));
        let users = Arc::new(MemoryUserRepository::new());

        let mut user = User::new(
            "Ada".into(),
            "Lovelace".into(),
            "ada@example.com".into(),
            "Europe/London".into(),
        );
        user.birthday_date = NaiveDate::from_ymd_opt(1990, 3, 10);
        users.insert(user.clone()).await;

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            users,
            queue: queue.clone(),
            delivery: Arc::new(delivery),
            breaker: Arc::new(CircuitBreaker::new(&DeliveryConfig::default(), clock.clone())),
            retry: RetryPolicy::default(),
            clock: clock.clone(),
            max_retries,
        });

        Fixture { ctx, store, queue, clock, user }
    }

    async fn queued_log(f: &Fixture) -> MessageLog {
        let now = f.ctx.clock.now_utc();
        let key = IdempotencyKey::new(f.user.id, "BIRTHDAY", now.date_naive());
        let log = MessageLog::scheduled(
            f.user.id,
            "BIRTHDAY",
            "Hey, Ada Lovelace it's your birthday!".into(),
            now,
            &key,
            now,
        );
        f.store.insert(&log).await.unwrap();
        f.store
            .compare_and_set_status(
                log.id,
                MessageStatus::Scheduled,
                MessageStatus::Queued,
                StatusUpdate::default(),
            )
            .await
            .unwrap();
        f.store.find_by_id(log.id).await.unwrap().unwrap()
    }

    async fn publish_and_pop(f: &Fixture, log: &MessageLog) -> QueuedJob {
        let queue = primary_queue(&log.message_type);
        let item = WorkItem::for_log(log, f.ctx.clock.now_utc());
        f.ctx
            .queue
            .publish(&queue, serde_json::to_value(&item).unwrap())
            .await
            .unwrap();
        f.ctx.queue.pop(&queue).await.unwrap().unwrap()
    }

    fn ok_response() -> Result<DeliveryResponse, DeliveryError> {
        Ok(DeliveryResponse { success: true, status_code: 200, body: Some("ok".into()) })
    }

    fn status_response(status_code: u16) -> Result<DeliveryResponse, DeliveryError> {
        Ok(DeliveryResponse { success: false, status_code, body: None })
    }

    #[tokio::test]
    async fn successful_delivery_marks_log_sent() {
        let mut delivery = MockDeliveryClient::new();
        delivery.expect_send().times(1).returning(|_| ok_response());

        let f = fixture(delivery, 3).await;
        let log = queued_log(&f).await;
        let job = publish_and_pop(&f, &log).await;

        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        process_delivery(f.ctx.clone(), job, "birthday_messages.dlq".into(), stats.clone()).await;

        let log = f.store.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, MessageStatus::Sent);
        assert_eq!(log.retry_count, 0);
        assert_eq!(log.api_response_code, Some(200));
        assert!(log.actual_send_time.is_some());
        assert_eq!(f.queue.size("birthday_messages").await.unwrap(), 0);
        assert_eq!(stats.read().await.sent, 1);
    }

    #[tokio::test]
    async fn already_sent_log_is_acknowledged_without_delivery() {
        // A redelivered item for a SENT log must never reach the client.
        let delivery = MockDeliveryClient::new();

        let f = fixture(delivery, 3).await;
        let log = queued_log(&f).await;
        let job = publish_and_pop(&f, &log).await;

        f.store
            .compare_and_set_status(log.id, MessageStatus::Queued, MessageStatus::Sending, StatusUpdate::default())
            .await
            .unwrap();
        f.store
            .compare_and_set_status(log.id, MessageStatus::Sending, MessageStatus::Sent, StatusUpdate::default())
            .await
            .unwrap();

        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        process_delivery(f.ctx.clone(), job, "birthday_messages.dlq".into(), stats).await;

        let log = f.store.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, MessageStatus::Sent);
        assert_eq!(f.queue.size("birthday_messages").await.unwrap(), 0);
        assert_eq!(f.queue.size("birthday_messages.dlq").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_after_one_attempt() {
        let mut delivery = MockDeliveryClient::new();
        delivery.expect_send().times(1).returning(|_| status_response(404));

        let f = fixture(delivery, 3).await;
        let log = queued_log(&f).await;
        let job = publish_and_pop(&f, &log).await;

        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        process_delivery(f.ctx.clone(), job, "birthday_messages.dlq".into(), stats).await;

        let log = f.store.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, MessageStatus::Failed);
        assert_eq!(log.retry_count, 0);
        assert_eq!(log.api_response_code, Some(404));
        assert_eq!(f.queue.size("birthday_messages.dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_failures_requeue_then_succeed() {
        // 503 three times, then success: the log ends SENT with the retry
        // count reflecting all three failed attempts.
        let mut delivery = MockDeliveryClient::new();
        let mut calls = 0;
        delivery.expect_send().times(4).returning(move |_| {
            calls += 1;
            if calls <= 3 { status_response(503) } else { ok_response() }
        });

        let f = fixture(delivery, 5).await;
        let log = queued_log(&f).await;
        let queue = primary_queue(&log.message_type);
        let item = WorkItem::for_log(&log, f.ctx.clock.now_utc());
        f.ctx
            .queue
            .publish(&queue, serde_json::to_value(&item).unwrap())
            .await
            .unwrap();

        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        for _ in 0..4 {
            // Redelivery delay is encoded in available_at; jump past it.
            f.clock.advance(chrono::Duration::seconds(60));
            let job = f.ctx.queue.pop(&queue).await.unwrap().unwrap();
            process_delivery(f.ctx.clone(), job, "birthday_messages.dlq".into(), stats.clone()).await;
        }

        let log = f.store.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, MessageStatus::Sent);
        assert_eq!(log.retry_count, 3);
        assert!(log.last_retry_at.is_some());
        assert_eq!(stats.read().await.retried, 3);
        assert_eq!(f.queue.size(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_and_dead_letters() {
        let mut delivery = MockDeliveryClient::new();
        delivery.expect_send().returning(|_| status_response(503));

        let f = fixture(delivery, 2).await;
        let log = queued_log(&f).await;
        let queue = primary_queue(&log.message_type);
        let item = WorkItem::for_log(&log, f.ctx.clock.now_utc());
        f.ctx
            .queue
            .publish(&queue, serde_json::to_value(&item).unwrap())
            .await
            .unwrap();

        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        for _ in 0..2 {
            f.clock.advance(chrono::Duration::seconds(60));
            let job = f.ctx.queue.pop(&queue).await.unwrap().unwrap();
            process_delivery(f.ctx.clone(), job, "birthday_messages.dlq".into(), stats.clone()).await;
        }

        let log = f.store.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, MessageStatus::Failed);
        assert_eq!(log.retry_count, 2);
        assert_eq!(f.queue.size("birthday_messages.dlq").await.unwrap(), 1);
        assert_eq!(f.queue.size(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn poison_payload_goes_to_the_dead_letter_queue() {
        let delivery = MockDeliveryClient::new();
        let f = fixture(delivery, 3).await;

        f.ctx
            .queue
            .publish("birthday_messages", serde_json::json!({"not": "a work item"}))
            .await
            .unwrap();
        let job = f.ctx.queue.pop("birthday_messages").await.unwrap().unwrap();

        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        process_delivery(f.ctx.clone(), job, "birthday_messages.dlq".into(), stats.clone()).await;

        assert_eq!(f.queue.size("birthday_messages.dlq").await.unwrap(), 1);
        assert_eq!(stats.read().await.dead_lettered, 1);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_and_requeues() {
        // No delivery call happens while the breaker is open.
        let delivery = MockDeliveryClient::new();
        let f = fixture(delivery, 5).await;

        for _ in 0..10 {
            f.ctx.breaker.record_failure();
        }
        assert!(f.ctx.breaker.is_open());

        let log = queued_log(&f).await;
        let job = publish_and_pop(&f, &log).await;

        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        process_delivery(f.ctx.clone(), job, "birthday_messages.dlq".into(), stats.clone()).await;

        let log = f.store.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, MessageStatus::Retrying);
        assert_eq!(log.retry_count, 1);
        assert_eq!(stats.read().await.retried, 1);
    }
}
