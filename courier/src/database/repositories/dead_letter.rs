//! Dead-letter repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::DeadLetterDbModel;
use crate::delivery::query::{DeadLetterFilter, Page};
use crate::{Error, Result};

/// `replay_result` of a claimed entry until its replay job finishes.
pub const REPLAY_QUEUED: &str = "queued";

/// Dead-letter repository trait.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Insert or replace the entry for a job. One row per job id.
    async fn upsert(&self, entry: &DeadLetterDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<DeadLetterDbModel>;
    /// Entries matching `filter`, most recent failure first.
    async fn list(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<DeadLetterDbModel>>;
    async fn count(&self) -> Result<u64>;

    /// Mark an entry as being replayed by `replay_job_id`, with result
    /// [`REPLAY_QUEUED`].
    ///
    /// Returns `false` when the entry was already replayed.
    async fn claim_replay(&self, id: &str, replay_job_id: &str, now_ms: i64) -> Result<bool>;
    /// Record the outcome of a claimed replay.
    async fn record_replay_result(&self, id: &str, result: &str) -> Result<()>;
    /// Undo a claim whose replay job was never accepted.
    async fn release_replay(&self, id: &str, replay_job_id: &str) -> Result<()>;

    /// Delete entries whose expiry is at or before `now_ms`.
    async fn delete_expired(&self, now_ms: i64) -> Result<u64>;
}

/// SQLx implementation of DeadLetterRepository.
pub struct SqlxDeadLetterRepository {
    pool: SqlitePool,
}

impl SqlxDeadLetterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterRepository for SqlxDeadLetterRepository {
    async fn upsert(&self, entry: &DeadLetterDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, destination, priority, payload, error_message, error_class,
                retry_count, submitted_at, failed_at, expires_at, replay_of,
                replayed_at, replay_job_id, replay_result
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                destination = excluded.destination,
                priority = excluded.priority,
                payload = excluded.payload,
                error_message = excluded.error_message,
                error_class = excluded.error_class,
                retry_count = excluded.retry_count,
                submitted_at = excluded.submitted_at,
                failed_at = excluded.failed_at,
                expires_at = excluded.expires_at,
                replay_of = excluded.replay_of
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.destination)
        .bind(&entry.priority)
        .bind(&entry.payload)
        .bind(&entry.error_message)
        .bind(&entry.error_class)
        .bind(entry.retry_count)
        .bind(entry.submitted_at)
        .bind(entry.failed_at)
        .bind(entry.expires_at)
        .bind(&entry.replay_of)
        .bind(entry.replayed_at)
        .bind(&entry.replay_job_id)
        .bind(&entry.replay_result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<DeadLetterDbModel> {
        sqlx::query_as::<_, DeadLetterDbModel>("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("DeadLetter", id))
    }

    async fn list(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<DeadLetterDbModel>> {
        // Build dynamic WHERE clause
        let mut conditions = Vec::new();

        if filter.destination.is_some() {
            conditions.push("destination = ?");
        }
        if filter.error_class.is_some() {
            conditions.push("error_class = ?");
        }
        match filter.replayed {
            Some(true) => conditions.push("replayed_at IS NOT NULL"),
            Some(false) => conditions.push("replayed_at IS NULL"),
            None => {}
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT * FROM dead_letters {} ORDER BY failed_at DESC, id LIMIT ? OFFSET ?",
            where_clause
        );

        let mut query = sqlx::query_as::<_, DeadLetterDbModel>(&sql);
        if let Some(ref destination) = filter.destination {
            query = query.bind(destination);
        }
        if let Some(class) = filter.error_class {
            query = query.bind(class.as_str());
        }
        query = query
            .bind(page.effective_limit() as i64)
            .bind(page.offset as i64);

        let entries = query.fetch_all(&self.pool).await?;
        Ok(entries)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn claim_replay(&self, id: &str, replay_job_id: &str, now_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters
            SET replayed_at = ?, replay_job_id = ?, replay_result = ?
            WHERE id = ? AND replayed_at IS NULL
            "#,
        )
        .bind(now_ms)
        .bind(replay_job_id)
        .bind(REPLAY_QUEUED)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "already replayed" from "no such entry".
        self.get(id).await?;
        Ok(false)
    }

    async fn record_replay_result(&self, id: &str, result: &str) -> Result<()> {
        sqlx::query("UPDATE dead_letters SET replay_result = ? WHERE id = ?")
            .bind(result)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_replay(&self, id: &str, replay_job_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dead_letters
            SET replayed_at = NULL, replay_job_id = NULL, replay_result = NULL
            WHERE id = ? AND replay_job_id = ?
            "#,
        )
        .bind(id)
        .bind(replay_job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
