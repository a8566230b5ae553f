//! Change-event persistence.
//!
//! A change event is the durable record of one URL-change notification
//! and the lifecycle of the rescrape that follows. Rows are owned by
//! Postgres; jobs reference them by id only. Each status transition is
//! its own short transaction — the external scrape must never run inside
//! one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Rescrape lifecycle states. Failure carries a truncated reason in the
/// stored string, `failed:<reason>`.
pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_COMPLETED: &str = "completed";

/// Reasons are truncated to this length before storage.
pub const MAX_FAILURE_REASON: usize = 200;

/// Build the stored status for a failure.
pub fn failed_status(reason: &str) -> String {
    let truncated: String = reason.chars().take(MAX_FAILURE_REASON).collect();
    format!("failed:{}", truncated)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: i64,
    pub watch_id: String,
    pub watch_url: String,
    pub detected_at: DateTime<Utc>,
    pub diff_summary: Option<String>,
    pub snapshot_url: Option<String>,
    pub rescrape_job_id: Option<String>,
    pub rescrape_status: String,
    pub indexed_at: Option<DateTime<Utc>>,
    pub extra_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new row; everything else defaults in the database.
#[derive(Debug, Clone)]
pub struct NewChangeEvent {
    pub watch_id: String,
    pub watch_url: String,
    pub detected_at: DateTime<Utc>,
    pub diff_summary: Option<String>,
    pub snapshot_url: Option<String>,
}

/// Partial update applied in one transaction. `merge_metadata` is merged
/// into the existing `extra_metadata` bag rather than replacing it.
#[derive(Debug, Clone, Default)]
pub struct ChangeEventUpdate {
    pub rescrape_status: Option<String>,
    pub rescrape_job_id: Option<String>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub merge_metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait MetadataDb: Send + Sync {
    async fn insert_change_event(&self, new: NewChangeEvent) -> AppResult<ChangeEvent>;
    async fn get_change_event(&self, id: i64) -> AppResult<Option<ChangeEvent>>;
    async fn update_change_event(&self, id: i64, update: ChangeEventUpdate) -> AppResult<()>;
    async fn health_check(&self) -> bool;
}

pub struct PostgresMetadataDb {
    pool: PgPool,
}

impl PostgresMetadataDb {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the change_events table when missing. Idempotent.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_events (
                id BIGSERIAL PRIMARY KEY,
                watch_id TEXT NOT NULL,
                watch_url TEXT NOT NULL,
                detected_at TIMESTAMPTZ NOT NULL,
                diff_summary TEXT,
                snapshot_url TEXT,
                rescrape_job_id TEXT,
                rescrape_status TEXT NOT NULL DEFAULT 'queued',
                indexed_at TIMESTAMPTZ,
                extra_metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("change_events schema ensured");
        Ok(())
    }

    fn row_to_event(row: sqlx::postgres::PgRow) -> AppResult<ChangeEvent> {
        Ok(ChangeEvent {
            id: row.try_get("id")?,
            watch_id: row.try_get("watch_id")?,
            watch_url: row.try_get("watch_url")?,
            detected_at: row.try_get("detected_at")?,
            diff_summary: row.try_get("diff_summary")?,
            snapshot_url: row.try_get("snapshot_url")?,
            rescrape_job_id: row.try_get("rescrape_job_id")?,
            rescrape_status: row.try_get("rescrape_status")?,
            indexed_at: row.try_get("indexed_at")?,
            extra_metadata: row.try_get("extra_metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl MetadataDb for PostgresMetadataDb {
    async fn insert_change_event(&self, new: NewChangeEvent) -> AppResult<ChangeEvent> {
        let row = sqlx::query(
            r#"
            INSERT INTO change_events
                (watch_id, watch_url, detected_at, diff_summary, snapshot_url, rescrape_status)
            VALUES ($1, $2, $3, $4, $5, 'queued')
            RETURNING *
            "#,
        )
        .bind(&new.watch_id)
        .bind(&new.watch_url)
        .bind(new.detected_at)
        .bind(&new.diff_summary)
        .bind(&new.snapshot_url)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_event(row)
    }

    async fn get_change_event(&self, id: i64) -> AppResult<Option<ChangeEvent>> {
        let row = sqlx::query("SELECT * FROM change_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_event).transpose()
    }

    async fn update_change_event(&self, id: i64, update: ChangeEventUpdate) -> AppResult<()> {
        // Single statement: status/job/indexed_at overwrite when present,
        // metadata merges via jsonb concatenation.
        let result = sqlx::query(
            r#"
            UPDATE change_events SET
                rescrape_status = COALESCE($2, rescrape_status),
                rescrape_job_id = COALESCE($3, rescrape_job_id),
                indexed_at = COALESCE($4, indexed_at),
                extra_metadata = extra_metadata || COALESCE($5, '{}'::jsonb)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.rescrape_status)
        .bind(&update.rescrape_job_id)
        .bind(update.indexed_at)
        .bind(&update.merge_metadata)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("change event {} missing", id)));
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!("database health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_status_truncates_reason() {
        let long = "x".repeat(500);
        let status = failed_status(&long);
        assert!(status.starts_with("failed:"));
        assert_eq!(status.len(), "failed:".len() + MAX_FAILURE_REASON);
    }

    #[test]
    fn test_failed_status_keeps_short_reason() {
        assert_eq!(failed_status("scrape timed out"), "failed:scrape timed out");
    }
}
