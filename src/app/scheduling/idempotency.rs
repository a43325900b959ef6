use chrono::NaiveDate;

use crate::app::models::DieselUlid;

/// Canonical name of one intended delivery: `userId|messageType|localDate`.
///
/// The date is the scheduled *local* date in the user's zone, so two
/// schedulers computing the same occurrence always derive the same key, and
/// next year's occurrence derives a different one. The key carries no
/// clock-dependent component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    user_id: String,
    message_type: String,
    local_date: NaiveDate,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum KeyParseError {
    #[error("idempotency key must have exactly three non-empty parts")]
    Malformed,

    #[error("idempotency key date is not a valid YYYY-MM-DD value: {0}")]
    BadDate(String),
}

impl IdempotencyKey {
    pub fn new(user_id: DieselUlid, message_type: &str, local_date: NaiveDate) -> Self {
        IdempotencyKey {
            user_id: user_id.to_string(),
            message_type: message_type.to_string(),
            local_date,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn local_date(&self) -> NaiveDate {
        self.local_date
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.user_id,
            self.message_type,
            self.local_date.format("%Y-%m-%d")
        )
    }
}

impl std::str::FromStr for IdempotencyKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        let [user_id, message_type, date] = parts.as_slice() else {
            return Err(KeyParseError::Malformed);
        };
        if user_id.is_empty() || message_type.is_empty() || date.is_empty() {
            return Err(KeyParseError::Malformed);
        }

        let local_date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| KeyParseError::BadDate(date.to_string()))?;

        Ok(IdempotencyKey {
            user_id: user_id.to_string(),
            message_type: message_type.to_string(),
            local_date,
        })
    }
}
