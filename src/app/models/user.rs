use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::DieselUlid;

/// User record as owned by the API layer. The scheduler only ever reads
/// these rows; creation, updates, and soft-deletion happen elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: DieselUlid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// IANA zone name (e.g. "America/New_York"), validated at write-time
    /// by the API layer. Zone arithmetic still re-validates on read.
    pub timezone: String,
    pub birthday_date: Option<NaiveDate>,
    pub anniversary_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-deletion marker: once set, scheduling ignores the user but
    /// existing message logs remain.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(
        first_name: String,
        last_name: String,
        email: String,
        timezone: String,
    ) -> Self {
        let now = Utc::now();
        User {
            id: DieselUlid::new(),
            first_name,
            last_name,
            email,
            timezone,
            birthday_date: None,
            anniversary_date: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Looks up an event-date field by the name a strategy declares as its
    /// trigger. Unknown field names resolve to `None` rather than erroring;
    /// the strategy's `validate` reports the misconfiguration.
    pub fn event_date(&self, trigger_field: &str) -> Option<NaiveDate> {
        match trigger_field {
            "birthday_date" => self.birthday_date,
            "anniversary_date" => self.anniversary_date,
            _ => None,
        }
    }
}
