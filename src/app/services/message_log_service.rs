use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use tokio::sync::RwLock;

use crate::app::models::message_log::{MessageLog, MessageStatus, NewMessageLog};
use crate::app::models::DieselUlid;
use crate::database::DbPool;
use crate::schema::message_logs;

/// Typed failures of the log store. `DuplicateKey` and `StatusConflict`
/// are control flow for callers; everything else is `Other`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate idempotency key: {0}")]
    DuplicateKey(String),

    #[error("message log {0} not found")]
    NotFound(DieselUlid),

    #[error("log {id} is not in status {expected} (found {found:?})")]
    StatusConflict {
        id: DieselUlid,
        expected: MessageStatus,
        found: Option<MessageStatus>,
    },

    #[error("transition {from} -> {to} is not an edge of the status machine")]
    IllegalTransition { from: MessageStatus, to: MessageStatus },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::Other(e.into())
    }
}

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        StoreError::Other(e.into())
    }
}

/// Optional fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub actual_send_time: Option<DateTime<Utc>>,
    pub retry_count: Option<i32>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub api_response_code: Option<i32>,
    pub api_response_body: Option<String>,
    pub error_message: Option<String>,
}

/// Durable record of every intended delivery. The unique constraint on
/// `idempotency_key` is the single serializing point between concurrent
/// schedulers; no in-process lock substitutes for it.
#[async_trait]
pub trait MessageLogStore: Send + Sync {
    /// Inserts a new log, surfacing a unique-key collision as
    /// `StoreError::DuplicateKey`.
    async fn insert(&self, log: &MessageLog) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: DieselUlid) -> Result<Option<MessageLog>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<MessageLog>, StoreError>;

    /// `SCHEDULED` logs with `scheduled_send_time <= due_by`, oldest first.
    async fn find_scheduled_due_by(
        &self,
        due_by: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageLog>, StoreError>;

    /// Non-terminal logs whose send time passed before `cutoff`.
    async fn find_overdue(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageLog>, StoreError>;

    /// Atomically moves a log from `from` to `to`, applying `update`, and
    /// returns the updated row. Fails with `StatusConflict` when the row is
    /// no longer in `from` — the caller re-reads and decides.
    async fn compare_and_set_status(
        &self,
        id: DieselUlid,
        from: MessageStatus,
        to: MessageStatus,
        update: StatusUpdate,
    ) -> Result<MessageLog, StoreError>;

    /// Removes non-terminal logs for a user whose send time is still ahead,
    /// so the next daily run recreates them from fresh user data. Terminal
    /// logs stay as audit records. Returns the number removed.
    async fn delete_future_non_terminal_for_user(
        &self,
        user_id: DieselUlid,
        after: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Counts per status, for the operator surface.
    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, i64)>, StoreError>;
}

pub struct DatabaseMessageLogStore {
    pool: DbPool,
}

impl DatabaseMessageLogStore {
    pub fn new(pool: DbPool) -> Self {
        DatabaseMessageLogStore { pool }
    }
}

const NON_TERMINAL: [&str; 4] = ["SCHEDULED", "QUEUED", "SENDING", "RETRYING"];

#[async_trait]
impl MessageLogStore for DatabaseMessageLogStore {
    async fn insert(&self, log: &MessageLog) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;

        let result = diesel::insert_into(message_logs::table)
            .values(NewMessageLog::from(log))
            .execute(&mut conn);

        match result {
            Ok(_) => Ok(()),
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(StoreError::DuplicateKey(log.idempotency_key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: DieselUlid) -> Result<Option<MessageLog>, StoreError> {
        let mut conn = self.pool.get()?;

        let result = message_logs::table
            .filter(message_logs::id.eq(id.to_string()))
            .select(MessageLog::as_select())
            .first::<MessageLog>(&mut conn)
            .optional()?;

        Ok(result)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<MessageLog>, StoreError> {
        let mut conn = self.pool.get()?;

        let result = message_logs::table
            .filter(message_logs::idempotency_key.eq(key))
            .select(MessageLog::as_select())
            .first::<MessageLog>(&mut conn)
            .optional()?;

        Ok(result)
    }

    async fn find_scheduled_due_by(
        &self,
        due_by: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageLog>, StoreError> {
        let mut conn = self.pool.get()?;

        let rows = message_logs::table
            .filter(message_logs::status.eq(MessageStatus::Scheduled.as_str()))
            .filter(message_logs::scheduled_send_time.le(due_by))
            .order(message_logs::scheduled_send_time.asc())
            .limit(limit)
            .select(MessageLog::as_select())
            .load::<MessageLog>(&mut conn)?;

        Ok(rows)
    }

    async fn find_overdue(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageLog>, StoreError> {
        let mut conn = self.pool.get()?;

        let rows = message_logs::table
            .filter(message_logs::status.eq_any(NON_TERMINAL))
            .filter(message_logs::scheduled_send_time.lt(cutoff))
            .order(message_logs::scheduled_send_time.asc())
            .limit(limit)
            .select(MessageLog::as_select())
            .load::<MessageLog>(&mut conn)?;

        Ok(rows)
    }

    async fn compare_and_set_status(
        &self,
        id: DieselUlid,
        from: MessageStatus,
        to: MessageStatus,
        update: StatusUpdate,
    ) -> Result<MessageLog, StoreError> {
        if !MessageStatus::can_transition(from, to) {
            return Err(StoreError::IllegalTransition { from, to });
        }

        let mut conn = self.pool.get()?;

        // The status filter makes this a row-level compare-and-set: zero
        // rows updated means another actor moved the log first.
        let updated = diesel::update(
            message_logs::table
                .filter(message_logs::id.eq(id.to_string()))
                .filter(message_logs::status.eq(from.as_str())),
        )
        .set((
            message_logs::status.eq(to),
            update.actual_send_time.map(|v| message_logs::actual_send_time.eq(v)),
            update.retry_count.map(|v| message_logs::retry_count.eq(v)),
            update.last_retry_at.map(|v| message_logs::last_retry_at.eq(v)),
            update.api_response_code.map(|v| message_logs::api_response_code.eq(v)),
            update.api_response_body.map(|v| message_logs::api_response_body.eq(v)),
            update.error_message.map(|v| message_logs::error_message.eq(v)),
            message_logs::updated_at.eq(Utc::now()),
        ))
        .returning(MessageLog::as_select())
        .get_result::<MessageLog>(&mut conn)
        .optional()?;

        match updated {
            Some(log) => Ok(log),
            None => {
                let found = self.find_by_id(id).await?.map(|log| log.status);
                match found {
                    Some(_) => Err(StoreError::StatusConflict { id, expected: from, found }),
                    None => Err(StoreError::NotFound(id)),
                }
            }
        }
    }

    async fn delete_future_non_terminal_for_user(
        &self,
        user_id: DieselUlid,
        after: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.pool.get()?;

        let deleted = diesel::delete(
            message_logs::table
                .filter(message_logs::user_id.eq(user_id.to_string()))
                .filter(message_logs::status.eq_any(NON_TERMINAL))
                .filter(message_logs::scheduled_send_time.gt(after)),
        )
        .execute(&mut conn)?;

        Ok(deleted as u64)
    }

    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, i64)>, StoreError> {
        let mut conn = self.pool.get()?;

        let rows: Vec<(MessageStatus, i64)> = message_logs::table
            .group_by(message_logs::status)
            .select((message_logs::status, diesel::dsl::count_star()))
            .load(&mut conn)?;

        Ok(rows)
    }
}

/// In-memory store for tests and local development. Mirrors the unique
/// key constraint and compare-and-set semantics of the database store.
#[derive(Default)]
pub struct MemoryMessageLogStore {
    logs: RwLock<Vec<MessageLog>>,
}

impl MemoryMessageLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<MessageLog> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl MessageLogStore for MemoryMessageLogStore {
    async fn insert(&self, log: &MessageLog) -> Result<(), StoreError> {
        let mut logs = self.logs.write().await;
        if logs.iter().any(|l| l.idempotency_key == log.idempotency_key) {
            return Err(StoreError::DuplicateKey(log.idempotency_key.clone()));
        }
        logs.push(log.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: DieselUlid) -> Result<Option<MessageLog>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.iter().find(|l| l.id == id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<MessageLog>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.iter().find(|l| l.idempotency_key == key).cloned())
    }

    async fn find_scheduled_due_by(
        &self,
        due_by: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageLog>, StoreError> {
        let logs = self.logs.read().await;
        let mut due: Vec<MessageLog> = logs
            .iter()
            .filter(|l| l.status == MessageStatus::Scheduled && l.scheduled_send_time <= due_by)
            .cloned()
            .collect();
        due.sort_by_key(|l| l.scheduled_send_time);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn find_overdue(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageLog>, StoreError> {
        let logs = self.logs.read().await;
        let mut overdue: Vec<MessageLog> = logs
            .iter()
            .filter(|l| !l.status.is_terminal() && l.scheduled_send_time < cutoff)
            .cloned()
            .collect();
        overdue.sort_by_key(|l| l.scheduled_send_time);
        overdue.truncate(limit as usize);
        Ok(overdue)
    }

    async fn compare_and_set_status(
        &self,
        id: DieselUlid,
        from: MessageStatus,
        to: MessageStatus,
        update: StatusUpdate,
    ) -> Result<MessageLog, StoreError> {
        if !MessageStatus::can_transition(from, to) {
            return Err(StoreError::IllegalTransition { from, to });
        }

        let mut logs = self.logs.write().await;
        let Some(log) = logs.iter_mut().find(|l| l.id == id) else {
            return Err(StoreError::NotFound(id));
        };
        if log.status != from {
            return Err(StoreError::StatusConflict {
                id,
                expected: from,
                found: Some(log.status),
            });
        }

        log.status = to;
        if let Some(v) = update.actual_send_time {
            log.actual_send_time = Some(v);
        }
        if let Some(v) = update.retry_count {
            log.retry_count = v;
        }
        if let Some(v) = update.last_retry_at {
            log.last_retry_at = Some(v);
        }
        if let Some(v) = update.api_response_code {
            log.api_response_code = Some(v);
        }
        if let Some(v) = update.api_response_body {
            log.api_response_body = Some(v);
        }
        if let Some(v) = update.error_message {
            log.error_message = Some(v);
        }
        log.updated_at = Utc::now();

        Ok(log.clone())
    }

    async fn delete_future_non_terminal_for_user(
        &self,
        user_id: DieselUlid,
        after: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut logs = self.logs.write().await;
        let before = logs.len();
        logs.retain(|l| {
            !(l.user_id == user_id && !l.status.is_terminal() && l.scheduled_send_time > after)
        });
        Ok((before - logs.len()) as u64)
    }

    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, i64)>, StoreError> {
        let logs = self.logs.read().await;
        let mut counts = std::collections::HashMap::new();
        for log in logs.iter() {
            *counts.entry(log.status).or_insert(0i64) += 1;
        }
        let mut rows: Vec<(MessageStatus, i64)> = counts.into_iter().collect();
        rows.sort_by_key(|(status, _)| status.as_str());
        Ok(rows)
    }
}
