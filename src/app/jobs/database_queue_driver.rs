use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::sql_query;
use std::time::Duration;

use super::{QueueDriver, QueuedJob};
use crate::app::models::DieselUlid;
use crate::database::DbPool;
use crate::schema::queue_jobs;

/// Database row representation for the queue_jobs table.
#[derive(Debug, Queryable, Identifiable, QueryableByName)]
#[diesel(table_name = queue_jobs)]
struct QueueJobRow {
    id: String,
    queue_name: String,
    payload: serde_json::Value,
    attempts: i32,
    available_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl QueueJobRow {
    fn into_queued_job(self) -> Result<QueuedJob> {
        Ok(QueuedJob {
            id: DieselUlid::from_string(&self.id)?,
            queue_name: self.queue_name,
            payload: self.payload,
            attempts: self.attempts,
            created_at: self.created_at,
        })
    }
}

/// Durable queue backed by PostgreSQL. Reservation happens with
/// `FOR UPDATE SKIP LOCKED` so concurrent consumers never hand out the
/// same job twice; a published row survives crashes until acked.
#[derive(Clone)]
pub struct DatabaseQueueDriver {
    pool: DbPool,
}

impl DatabaseQueueDriver {
    pub fn new(pool: DbPool) -> Self {
        DatabaseQueueDriver { pool }
    }
}

#[async_trait]
impl QueueDriver for DatabaseQueueDriver {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<()> {
        let mut conn = self.pool.get()?;
        let now = Utc::now();

        diesel::insert_into(queue_jobs::table)
            .values((
                queue_jobs::id.eq(DieselUlid::new().to_string()),
                queue_jobs::queue_name.eq(queue),
                queue_jobs::payload.eq(payload),
                queue_jobs::attempts.eq(0),
                queue_jobs::available_at.eq(now),
                queue_jobs::created_at.eq(now),
                queue_jobs::updated_at.eq(now),
            ))
            .execute(&mut conn)?;

        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let mut conn = self.pool.get()?;

        // SKIP LOCKED reservation needs raw SQL; Diesel has no dsl for it.
        let row: Option<QueueJobRow> = sql_query(
            r#"
            UPDATE queue_jobs
            SET reserved_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM queue_jobs
                WHERE queue_name = $1
                  AND reserved_at IS NULL
                  AND available_at <= NOW()
                ORDER BY available_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind::<diesel::sql_types::Text, _>(queue)
        .get_result(&mut conn)
        .optional()?;

        row.map(QueueJobRow::into_queued_job).transpose()
    }

    async fn ack(&self, job_id: DieselUlid) -> Result<()> {
        let mut conn = self.pool.get()?;

        diesel::delete(queue_jobs::table.filter(queue_jobs::id.eq(job_id.to_string())))
            .execute(&mut conn)?;

        Ok(())
    }

    async fn nack(&self, job_id: DieselUlid, delay: Duration) -> Result<()> {
        let mut conn = self.pool.get()?;
        let now = Utc::now();
        let available_at = now + ChronoDuration::from_std(delay)?;

        diesel::update(queue_jobs::table.filter(queue_jobs::id.eq(job_id.to_string())))
            .set((
                queue_jobs::attempts.eq(queue_jobs::attempts + 1),
                queue_jobs::reserved_at.eq::<Option<DateTime<Utc>>>(None),
                queue_jobs::available_at.eq(available_at),
                queue_jobs::updated_at.eq(now),
            ))
            .execute(&mut conn)?;

        Ok(())
    }

    async fn dead_letter(&self, job_id: DieselUlid, dlq: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        let now = Utc::now();

        diesel::update(queue_jobs::table.filter(queue_jobs::id.eq(job_id.to_string())))
            .set((
                queue_jobs::queue_name.eq(dlq),
                queue_jobs::reserved_at.eq::<Option<DateTime<Utc>>>(None),
                queue_jobs::updated_at.eq(now),
            ))
            .execute(&mut conn)?;

        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let mut conn = self.pool.get()?;

        let count = queue_jobs::table
            .filter(queue_jobs::queue_name.eq(queue))
            .filter(queue_jobs::reserved_at.is_null())
            .count()
            .get_result::<i64>(&mut conn)?;

        Ok(count as u64)
    }

    async fn reclaim_stale(&self, queue: &str, older_than: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.get()?;

        let reclaimed = diesel::update(
            queue_jobs::table
                .filter(queue_jobs::queue_name.eq(queue))
                .filter(queue_jobs::reserved_at.lt(older_than)),
        )
        .set((
            queue_jobs::reserved_at.eq::<Option<DateTime<Utc>>>(None),
            queue_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)?;

        Ok(reclaimed as u64)
    }

    async fn drain_to(&self, from: &str, to: &str) -> Result<u64> {
        let mut conn = self.pool.get()?;
        let now = Utc::now();

        let moved = diesel::update(queue_jobs::table.filter(queue_jobs::queue_name.eq(from)))
            .set((
                queue_jobs::queue_name.eq(to),
                queue_jobs::reserved_at.eq::<Option<DateTime<Utc>>>(None),
                queue_jobs::available_at.eq(now),
                queue_jobs::updated_at.eq(now),
            ))
            .execute(&mut conn)?;

        Ok(moved as u64)
    }

    async fn prune(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.get()?;

        let pruned = diesel::delete(
            queue_jobs::table
                .filter(queue_jobs::queue_name.eq(queue))
                .filter(queue_jobs::created_at.lt(cutoff)),
        )
        .execute(&mut conn)?;

        Ok(pruned as u64)
    }

    fn driver_name(&self) -> &'static str {
        "database"
    }
}
