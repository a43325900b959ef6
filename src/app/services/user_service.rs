use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tokio::sync::RwLock;

use crate::app::models::user::User;
use crate::app::models::DieselUlid;
use crate::app::scheduling::timezone::TimezoneEngine;
use crate::database::DbPool;
use crate::schema::users;

/// Read-only view of the user table. The scheduler never writes users.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: DieselUlid) -> Result<Option<User>>;

    /// Users whose `trigger_field` month-and-day matches their local today.
    /// Soft-deleted users are excluded. Users whose stored zone no longer
    /// parses are skipped here and surface through strategy validation.
    async fn find_event_candidates(
        &self,
        trigger_field: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>>;
}

pub struct DatabaseUserRepository {
    pool: DbPool,
}

impl DatabaseUserRepository {
    pub fn new(pool: DbPool) -> Self {
        DatabaseUserRepository { pool }
    }
}

#[async_trait]
impl UserRepository for DatabaseUserRepository {
    async fn find_by_id(&self, id: DieselUlid) -> Result<Option<User>> {
        let mut conn = self.pool.get()?;

        let result = users::table
            .filter(users::id.eq(id.to_string()))
            .filter(users::deleted_at.is_null())
            .select(User::as_select())
            .first::<User>(&mut conn)
            .optional()?;

        Ok(result)
    }

    // Pulls every live user with the trigger field set and filters the
    // month-day match in process. Local "today" spans a 28-hour UTC window
    // across zones, so the date filter cannot be expressed as a single
    // UTC comparison; a month-day expression index is the upgrade path if
    // this scan shows up in query plans.
    async fn find_event_candidates(
        &self,
        trigger_field: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        let mut conn = self.pool.get()?;

        let query = users::table
            .filter(users::deleted_at.is_null())
            .select(User::as_select())
            .into_boxed();

        let query = match trigger_field {
            "birthday_date" => query.filter(users::birthday_date.is_not_null()),
            "anniversary_date" => query.filter(users::anniversary_date.is_not_null()),
            _ => return Ok(Vec::new()),
        };

        let rows = query.load::<User>(&mut conn)?;

        Ok(filter_candidates(rows, trigger_field, now))
    }
}

/// In-memory repository for tests and local development.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<Vec<User>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: User) {
        self.users.write().await.push(user);
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_id(&self, id: DieselUlid) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.id == id && !u.is_deleted()).cloned())
    }

    async fn find_event_candidates(
        &self,
        trigger_field: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        let users = self.users.read().await;
        let live = users
            .iter()
            .filter(|u| !u.is_deleted() && u.event_date(trigger_field).is_some())
            .cloned()
            .collect();
        Ok(filter_candidates(live, trigger_field, now))
    }
}

fn filter_candidates(rows: Vec<User>, trigger_field: &str, now: DateTime<Utc>) -> Vec<User> {
    rows.into_iter()
        .filter(|user| {
            let Some(event) = user.event_date(trigger_field) else {
                return false;
            };
            match TimezoneEngine::validate_zone(&user.timezone) {
                Ok(zone) => TimezoneEngine::is_event_today(event, zone, now),
                Err(e) => {
                    tracing::warn!(user_id = %user.id, error = %e, "skipping user with invalid zone");
                    false
                }
            }
        })
        .collect()
}
