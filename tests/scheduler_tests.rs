use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use wellwisher::app::jobs::{MemoryQueueDriver, QueueDriver, QueuedJob};
use wellwisher::app::models::message_log::MessageStatus;
use wellwisher::app::models::{DieselUlid, User};
use wellwisher::app::scheduling::{
    DailyScheduler, ManualClock, MinuteEnqueuer, RecoveryLoop,
};
use wellwisher::app::services::message_log_service::{
    MemoryMessageLogStore, MessageLogStore, StatusUpdate,
};
use wellwisher::app::services::MemoryUserRepository;
use wellwisher::app::strategies::StrategyRegistry;

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

fn user(first: &str, zone: &str, birthday: Option<NaiveDate>, anniversary: Option<NaiveDate>) -> User {
    let mut user = User::new(
        first.to_string(),
        "Example".to_string(),
        format!("{}@example.com", first.to_lowercase()),
        zone.to_string(),
    );
    user.birthday_date = birthday;
    user.anniversary_date = anniversary;
    user
}

struct Harness {
    clock: Arc<ManualClock>,
    users: Arc<MemoryUserRepository>,
    store: Arc<MemoryMessageLogStore>,
    daily: DailyScheduler,
}

/// 2025-06-15 12:00 UTC: mid-day for most of the world, already June 16 in
/// UTC+14.
fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(noon()));
    let users = Arc::new(MemoryUserRepository::new());
    let store = Arc::new(MemoryMessageLogStore::new());
    let daily = DailyScheduler::new(
        Arc::new(StrategyRegistry::with_builtins()),
        users.clone(),
        store.clone(),
        clock.clone(),
    );
    Harness { clock, users, store, daily }
}

#[tokio::test]
async fn daily_run_schedules_todays_occurrences_at_nine_local() {
    let h = harness();
    h.users.insert(user("Ada", "UTC", Some(date(1990, 6, 15)), None)).await;
    h.users.insert(user("Bram", "Asia/Kathmandu", Some(date(1985, 6, 15)), None)).await;
    // Already June 16 in Kiritimati at 12:00 UTC.
    h.users.insert(user("Cleo", "Pacific/Kiritimati", Some(date(1970, 6, 16)), None)).await;
    // Not their day.
    h.users.insert(user("Dave", "UTC", Some(date(1990, 1, 1)), None)).await;

    let summary = h.daily.run_once().await.unwrap();
    assert_eq!(summary.scheduled, 3);
    assert_eq!(summary.already_scheduled, 0);

    let logs = h.store.all().await;
    assert_eq!(logs.len(), 3);
    for log in &logs {
        assert_eq!(log.status, MessageStatus::Scheduled);
        assert_eq!(log.retry_count, 0);
    }

    let send_time_for = |name: &str| {
        logs.iter()
            .find(|l| l.message_content.contains(name))
            .map(|l| l.scheduled_send_time)
            .unwrap()
    };
    assert_eq!(send_time_for("Ada"), Utc.with_ymd_and_hms(2025, 6, 15, 9, 0, 0).unwrap());
    assert_eq!(send_time_for("Bram"), Utc.with_ymd_and_hms(2025, 6, 15, 3, 15, 0).unwrap());
    // 09:00 June 16 in UTC+14 is 19:00 June 15 UTC.
    assert_eq!(send_time_for("Cleo"), Utc.with_ymd_and_hms(2025, 6, 15, 19, 0, 0).unwrap());
}

#[tokio::test]
async fn scheduled_logs_are_findable_by_their_idempotency_key() {
    let h = harness();
    let ada = user("Ada", "UTC", Some(date(1990, 6, 15)), None);
    let ada_id = ada.id;
    h.users.insert(ada).await;
    h.daily.run_once().await.unwrap();

    let key = format!("{ada_id}|BIRTHDAY|2025-06-15");
    let log = h.store.find_by_idempotency_key(&key).await.unwrap().unwrap();
    assert_eq!(log.user_id, ada_id);
    assert_eq!(log.message_type, "BIRTHDAY");

    assert!(h
        .store
        .find_by_idempotency_key("nobody|BIRTHDAY|2025-06-15")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn daily_run_is_idempotent() {
    let h = harness();
    for i in 0..20 {
        h.users
            .insert(user(&format!("User{i}"), "UTC", Some(date(1990, 6, 15)), None))
            .await;
    }

    let first = h.daily.run_once().await.unwrap();
    assert_eq!(first.scheduled, 20);

    let second = h.daily.run_once().await.unwrap();
    assert_eq!(second.scheduled, 0);
    assert_eq!(second.already_scheduled, 20);
    assert_eq!(h.store.all().await.len(), 20);
}

#[tokio::test]
async fn both_strategies_on_one_user_produce_distinct_logs() {
    let h = harness();
    h.users
        .insert(user("Eve", "UTC", Some(date(1990, 6, 15)), Some(date(2020, 6, 15))))
        .await;

    let summary = h.daily.run_once().await.unwrap();
    assert_eq!(summary.scheduled, 2);

    let logs = h.store.all().await;
    let mut types: Vec<&str> = logs.iter().map(|l| l.message_type.as_str()).collect();
    types.sort();
    assert_eq!(types, vec!["ANNIVERSARY", "BIRTHDAY"]);
    assert_ne!(logs[0].idempotency_key, logs[1].idempotency_key);
}

#[tokio::test]
async fn soft_deleted_users_are_not_scheduled() {
    let h = harness();
    let mut ghost = user("Ghost", "UTC", Some(date(1990, 6, 15)), None);
    ghost.deleted_at = Some(noon() - ChronoDuration::days(1));
    h.users.insert(ghost).await;

    let summary = h.daily.run_once().await.unwrap();
    assert_eq!(summary.scheduled, 0);
    assert!(h.store.all().await.is_empty());
}

#[tokio::test]
async fn invalid_zone_user_is_skipped_not_fatal() {
    let h = harness();
    h.users.insert(user("Ada", "UTC", Some(date(1990, 6, 15)), None)).await;
    h.users.insert(user("Bad", "EST", Some(date(1990, 6, 15)), None)).await;

    let summary = h.daily.run_once().await.unwrap();
    assert_eq!(summary.scheduled, 1);
    assert_eq!(h.store.all().await.len(), 1);
}

#[tokio::test]
async fn enqueuer_publishes_due_logs_with_the_canonical_payload() {
    let h = harness();
    h.users.insert(user("Ada", "UTC", Some(date(1990, 6, 15)), None)).await;
    h.daily.run_once().await.unwrap();

    let queue = Arc::new(MemoryQueueDriver::new(h.clock.clone()));
    let enqueuer = MinuteEnqueuer::new(
        h.store.clone(),
        queue.clone(),
        h.clock.clone(),
        Duration::from_secs(60),
    );

    // 12:00 is well past the 09:00 send time, so the log is due.
    let enqueued = enqueuer.run_once().await.unwrap();
    assert_eq!(enqueued, 1);

    let log = &h.store.all().await[0];
    assert_eq!(log.status, MessageStatus::Queued);

    let payloads = queue.payloads("birthday_messages").await;
    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload["messageId"], log.id.to_string().as_str());
    assert_eq!(payload["userId"], log.user_id.to_string().as_str());
    assert_eq!(payload["messageType"], "BIRTHDAY");
    assert_eq!(payload["scheduledSendTime"], "2025-06-15T09:00:00Z");
    assert_eq!(payload["retryCount"], 0);
    assert_eq!(payload["enqueuedAt"], noon().timestamp_millis());

    // A second tick finds nothing in SCHEDULED.
    assert_eq!(enqueuer.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn enqueuer_skips_logs_outside_the_lookahead() {
    let h = harness();
    h.users.insert(user("Ada", "UTC", Some(date(1990, 6, 15)), None)).await;
    h.daily.run_once().await.unwrap();

    // Rewind to 05:00: the 09:00 send time is hours past the lookahead.
    h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 5, 0, 0).unwrap());

    let queue = Arc::new(MemoryQueueDriver::new(h.clock.clone()));
    let enqueuer = MinuteEnqueuer::new(
        h.store.clone(),
        queue.clone(),
        h.clock.clone(),
        Duration::from_secs(60),
    );

    assert_eq!(enqueuer.run_once().await.unwrap(), 0);
    assert_eq!(h.store.all().await[0].status, MessageStatus::Scheduled);

    // Within the lookahead window it goes out, ahead of the send time.
    h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 8, 59, 30).unwrap());
    assert_eq!(enqueuer.run_once().await.unwrap(), 1);
}

/// Queue driver whose publish always fails, for the rollback path.
struct BrokenQueueDriver;

#[async_trait]
impl QueueDriver for BrokenQueueDriver {
    async fn publish(&self, _queue: &str, _payload: serde_json::Value) -> Result<()> {
        anyhow::bail!("broker unavailable")
    }

    async fn pop(&self, _queue: &str) -> Result<Option<QueuedJob>> {
        Ok(None)
    }

    async fn ack(&self, _job_id: DieselUlid) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _job_id: DieselUlid, _delay: Duration) -> Result<()> {
        Ok(())
    }

    async fn dead_letter(&self, _job_id: DieselUlid, _dlq: &str) -> Result<()> {
        Ok(())
    }

    async fn size(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn reclaim_stale(&self, _queue: &str, _older_than: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }

    async fn drain_to(&self, _from: &str, _to: &str) -> Result<u64> {
        Ok(0)
    }

    async fn prune(&self, _queue: &str, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }

    fn driver_name(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn publish_failure_rolls_the_log_back_to_scheduled() {
    let h = harness();
    h.users.insert(user("Ada", "UTC", Some(date(1990, 6, 15)), None)).await;
    h.daily.run_once().await.unwrap();

    let enqueuer = MinuteEnqueuer::new(
        h.store.clone(),
        Arc::new(BrokenQueueDriver),
        h.clock.clone(),
        Duration::from_secs(60),
    );

    assert_eq!(enqueuer.run_once().await.unwrap(), 0);
    // Back to SCHEDULED so the next tick retries.
    assert_eq!(h.store.all().await[0].status, MessageStatus::Scheduled);
}

#[tokio::test]
async fn recovery_reopens_stuck_logs_and_fails_exhausted_ones() {
    let h = harness();
    h.users.insert(user("Ada", "UTC", Some(date(1990, 6, 15)), None)).await;
    h.users.insert(user("Bram", "UTC", Some(date(1985, 6, 15)), None)).await;
    h.users.insert(user("Cleo", "UTC", Some(date(1970, 6, 15)), None)).await;
    h.daily.run_once().await.unwrap();

    let logs = h.store.all().await;
    let stuck_queued = logs.iter().find(|l| l.message_content.contains("Ada")).unwrap().id;
    let stuck_sending = logs.iter().find(|l| l.message_content.contains("Bram")).unwrap().id;
    let exhausted = logs.iter().find(|l| l.message_content.contains("Cleo")).unwrap().id;

    h.store
        .compare_and_set_status(stuck_queued, MessageStatus::Scheduled, MessageStatus::Queued, StatusUpdate::default())
        .await
        .unwrap();
    h.store
        .compare_and_set_status(stuck_sending, MessageStatus::Scheduled, MessageStatus::Queued, StatusUpdate::default())
        .await
        .unwrap();
    h.store
        .compare_and_set_status(stuck_sending, MessageStatus::Queued, MessageStatus::Sending, StatusUpdate::default())
        .await
        .unwrap();
    h.store
        .compare_and_set_status(
            exhausted,
            MessageStatus::Scheduled,
            MessageStatus::Queued,
            StatusUpdate { retry_count: Some(3), ..Default::default() },
        )
        .await
        .unwrap();

    // Jump far past the 09:00 send time plus grace.
    h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap());

    let recovery = RecoveryLoop::new(h.store.clone(), h.clock.clone(), Duration::from_secs(300), 3);
    let summary = recovery.run_once().await.unwrap();
    assert_eq!(summary.reopened, 2);
    assert_eq!(summary.failed, 1);

    let status_of = |id| {
        let logs = &h.store;
        async move { logs.find_by_id(id).await.unwrap().unwrap().status }
    };
    assert_eq!(status_of(stuck_queued).await, MessageStatus::Scheduled);
    assert_eq!(status_of(stuck_sending).await, MessageStatus::Scheduled);
    assert_eq!(status_of(exhausted).await, MessageStatus::Failed);
}

#[tokio::test]
async fn recovery_leaves_recent_and_terminal_logs_alone() {
    let h = harness();
    h.users.insert(user("Ada", "UTC", Some(date(1990, 6, 15)), None)).await;
    h.daily.run_once().await.unwrap();
    let id = h.store.all().await[0].id;

    h.store
        .compare_and_set_status(id, MessageStatus::Scheduled, MessageStatus::Queued, StatusUpdate::default())
        .await
        .unwrap();

    // 09:02 is overdue but inside the five-minute grace.
    h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 9, 2, 0).unwrap());
    let recovery = RecoveryLoop::new(h.store.clone(), h.clock.clone(), Duration::from_secs(300), 3);
    assert_eq!(recovery.run_once().await.unwrap().reopened, 0);

    // A SENT log is never touched, no matter how old.
    h.store
        .compare_and_set_status(id, MessageStatus::Queued, MessageStatus::Sending, StatusUpdate::default())
        .await
        .unwrap();
    h.store
        .compare_and_set_status(id, MessageStatus::Sending, MessageStatus::Sent, StatusUpdate::default())
        .await
        .unwrap();
    h.clock.set(Utc.with_ymd_and_hms(2025, 6, 16, 9, 0, 0).unwrap());
    let summary = recovery.run_once().await.unwrap();
    assert_eq!(summary.reopened, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(h.store.find_by_id(id).await.unwrap().unwrap().status, MessageStatus::Sent);
}

#[tokio::test]
async fn user_updates_clear_future_non_terminal_logs_only() {
    let h = harness();
    let ada = user("Ada", "UTC", Some(date(1990, 6, 15)), Some(date(2020, 6, 15)));
    let ada_id = ada.id;
    h.users.insert(ada).await;
    h.daily.run_once().await.unwrap();

    let logs = h.store.all().await;
    assert_eq!(logs.len(), 2);
    let sent_id = logs[0].id;
    h.store
        .compare_and_set_status(sent_id, MessageStatus::Scheduled, MessageStatus::Queued, StatusUpdate::default())
        .await
        .unwrap();
    h.store
        .compare_and_set_status(sent_id, MessageStatus::Queued, MessageStatus::Sending, StatusUpdate::default())
        .await
        .unwrap();
    h.store
        .compare_and_set_status(sent_id, MessageStatus::Sending, MessageStatus::Sent, StatusUpdate::default())
        .await
        .unwrap();

    // The API layer calls this when a zone or event date changes; the next
    // daily run recreates the open occurrences under fresh keys.
    let removed = h
        .store
        .delete_future_non_terminal_for_user(ada_id, Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap())
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining = h.store.all().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, sent_id);
    assert_eq!(remaining[0].status, MessageStatus::Sent);
}
