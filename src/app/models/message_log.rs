use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use std::io::Write;

use super::DieselUlid;
use crate::app::scheduling::idempotency::IdempotencyKey;

/// Delivery state of a message log.
///
/// Allowed transitions:
///
/// ```text
/// SCHEDULED -> QUEUED      (minute enqueue)
/// QUEUED    -> SENDING     (worker pick-up)
/// SENDING   -> SENT        (delivery success, terminal)
/// SENDING   -> RETRYING    (transient failure below the retry cap)
/// RETRYING  -> QUEUED      (queue redelivers)
/// SENDING   -> FAILED      (permanent failure or retry cap, terminal)
/// QUEUED | RETRYING | SENDING -> SCHEDULED   (recovery reopens a stuck log)
/// QUEUED | RETRYING | SCHEDULED -> FAILED    (recovery gives up at the cap)
/// ```
///
/// `SENT` and `FAILED` are terminal: nothing transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow, Serialize, Deserialize)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Scheduled,
    Queued,
    Sending,
    Sent,
    Failed,
    Retrying,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "SCHEDULED",
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Sending => "SENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Retrying => "RETRYING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(MessageStatus::Scheduled),
            "QUEUED" => Some(MessageStatus::Queued),
            "SENDING" => Some(MessageStatus::Sending),
            "SENT" => Some(MessageStatus::Sent),
            "FAILED" => Some(MessageStatus::Failed),
            "RETRYING" => Some(MessageStatus::Retrying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }

    /// Whether `from -> to` is an edge of the status machine. The store's
    /// compare-and-set enforces the `from` side; this guards the `to` side.
    pub fn can_transition(from: MessageStatus, to: MessageStatus) -> bool {
        use MessageStatus::*;
        match (from, to) {
            (Scheduled, Queued) => true,
            (Queued, Sending) => true,
            (Sending, Sent) => true,
            (Sending, Retrying) => true,
            (Retrying, Queued) => true,
            (Sending, Failed) => true,
            // Recovery reopens stuck logs or gives up at the retry cap.
            (Queued | Retrying | Sending, Scheduled) => true,
            (Scheduled | Queued | Retrying, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Pg> for MessageStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for MessageStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        MessageStatus::parse(&s).ok_or_else(|| format!("unknown message status: {s}").into())
    }
}

/// One intended delivery of a greeting to a user. Owned by the scheduler;
/// the unique `idempotency_key` is what makes re-scheduling and redelivery
/// collapse into a single send.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Identifiable, AsChangeset)]
#[diesel(table_name = crate::schema::message_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MessageLog {
    pub id: DieselUlid,
    pub user_id: DieselUlid,
    pub message_type: String,
    /// Pre-composed plain text, stored so retries deliver identical content.
    pub message_content: String,
    pub scheduled_send_time: DateTime<Utc>,
    pub actual_send_time: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub api_response_code: Option<i32>,
    pub api_response_body: Option<String>,
    pub error_message: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::message_logs)]
pub struct NewMessageLog {
    pub id: DieselUlid,
    pub user_id: DieselUlid,
    pub message_type: String,
    pub message_content: String,
    pub scheduled_send_time: DateTime<Utc>,
    pub status: MessageStatus,
    pub retry_count: i32,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageLog {
    pub fn scheduled(
        user_id: DieselUlid,
        message_type: &str,
        message_content: String,
        scheduled_send_time: DateTime<Utc>,
        idempotency_key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Self {
        MessageLog {
            id: DieselUlid::new(),
            user_id,
            message_type: message_type.to_string(),
            message_content,
            scheduled_send_time,
            actual_send_time: None,
            status: MessageStatus::Scheduled,
            retry_count: 0,
            last_retry_at: None,
            api_response_code: None,
            api_response_body: None,
            error_message: None,
            idempotency_key: idempotency_key.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&MessageLog> for NewMessageLog {
    fn from(log: &MessageLog) -> Self {
        NewMessageLog {
            id: log.id,
            user_id: log.user_id,
            message_type: log.message_type.clone(),
            message_content: log.message_content.clone(),
            scheduled_send_time: log.scheduled_send_time,
            status: log.status,
            retry_count: log.retry_count,
            idempotency_key: log.idempotency_key.clone(),
            created_at: log.created_at,
            updated_at: log.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use MessageStatus::*;
        for from in [Sent, Failed] {
            for to in [Scheduled, Queued, Sending, Sent, Failed, Retrying] {
                assert!(!MessageStatus::can_transition(from, to));
            }
        }
    }

    #[test]
    fn happy_path_edges_are_allowed() {
        use MessageStatus::*;
        assert!(MessageStatus::can_transition(Scheduled, Queued));
        assert!(MessageStatus::can_transition(Queued, Sending));
        assert!(MessageStatus::can_transition(Sending, Sent));
        assert!(MessageStatus::can_transition(Sending, Retrying));
        assert!(MessageStatus::can_transition(Retrying, Queued));
        assert!(MessageStatus::can_transition(Sending, Failed));
    }

    #[test]
    fn status_round_trips_through_text() {
        use MessageStatus::*;
        for status in [Scheduled, Queued, Sending, Sent, Failed, Retrying] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("PENDING"), None);
    }
}
