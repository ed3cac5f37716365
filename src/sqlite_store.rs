//! SQLite-backed [`TaskStore`] and [`ResourceStore`] implementations.
//!
//! Task rows mirror every [`UploadTask`] field. The received-chunk set is
//! stored as a JSON array and timestamps as unix milliseconds.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use resource_share_core::models::{NewResource, TaskStatus, UploadTask};
use resource_share_core::store::{ResourceStore, TaskStore};

const TASK_COLUMNS: &str = "id, owner_id, file_name, file_size, description, chunk_size, \
    total_chunks, uploaded_chunks, status, progress, error, file_path, category, resource_id, \
    finalize_attempted, created_at, updated_at";

/// SQLite implementation of the [`TaskStore`] trait over `upload_tasks`.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every persisted task for `owner_id`, oldest first.
    pub async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<UploadTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_tasks WHERE owner_id = ? ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("invalid timestamp: {}", ms))
}

fn task_from_row(row: &SqliteRow) -> Result<UploadTask> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let chunks_json: String = row.get("uploaded_chunks");
    let uploaded_chunks: BTreeSet<u32> = serde_json::from_str(&chunks_json)
        .with_context(|| format!("corrupt uploaded_chunks for task {}", id))?;

    Ok(UploadTask {
        owner_id: row.get("owner_id"),
        file_name: row.get("file_name"),
        file_size: u64::try_from(row.get::<i64, _>("file_size"))?,
        description: row.get("description"),
        chunk_size: u64::try_from(row.get::<i64, _>("chunk_size"))?,
        total_chunks: u32::try_from(row.get::<i64, _>("total_chunks"))?,
        uploaded_chunks,
        status: status.parse::<TaskStatus>()?,
        progress: u8::try_from(row.get::<i64, _>("progress"))?,
        error: row.get("error"),
        file_path: row.get("file_path"),
        category: row.get("category"),
        resource_id: row.get("resource_id"),
        finalize_attempted: row.get::<i64, _>("finalize_attempted") != 0,
        created_at: millis_to_datetime(row.get("created_at"))?,
        updated_at: millis_to_datetime(row.get("updated_at"))?,
        id,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn upsert(&self, task: &UploadTask) -> Result<()> {
        let chunks_json = serde_json::to_string(&task.uploaded_chunks)?;

        sqlx::query(
            r#"
            INSERT INTO upload_tasks (id, owner_id, file_name, file_size, description,
                                      chunk_size, total_chunks, uploaded_chunks, status,
                                      progress, error, file_path, category, resource_id,
                                      finalize_attempted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                file_name = excluded.file_name,
                file_size = excluded.file_size,
                description = excluded.description,
                chunk_size = excluded.chunk_size,
                total_chunks = excluded.total_chunks,
                uploaded_chunks = excluded.uploaded_chunks,
                status = excluded.status,
                progress = excluded.progress,
                error = excluded.error,
                file_path = excluded.file_path,
                category = excluded.category,
                resource_id = excluded.resource_id,
                finalize_attempted = excluded.finalize_attempted,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.id)
        .bind(task.owner_id)
        .bind(&task.file_name)
        .bind(task.file_size as i64)
        .bind(&task.description)
        .bind(task.chunk_size as i64)
        .bind(task.total_chunks as i64)
        .bind(&chunks_json)
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(&task.error)
        .bind(&task.file_path)
        .bind(&task.category)
        .bind(task.resource_id)
        .bind(task.finalize_attempted as i64)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_recoverable(&self, terminal_cutoff: DateTime<Utc>) -> Result<Vec<UploadTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_tasks \
             WHERE status NOT IN ('completed', 'failed') OR updated_at >= ? \
             ORDER BY id ASC",
            TASK_COLUMNS
        ))
        .bind(terminal_cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM upload_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_stale(&self, terminal_cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM upload_tasks WHERE status IN ('completed', 'failed') AND updated_at < ?",
        )
        .bind(terminal_cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// SQLite implementation of the [`ResourceStore`] trait over `resources`.
#[derive(Clone)]
pub struct SqliteResourceStore {
    pool: SqlitePool,
}

impl SqliteResourceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of resource rows, shown by `rshare tasks`.
    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resources")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    async fn insert(&self, resource: &NewResource) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO resources (name, orig_name, size, category, description,
                                   file_path, file_type, uploader_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&resource.name)
        .bind(&resource.original_name)
        .bind(resource.size as i64)
        .bind(&resource.category)
        .bind(&resource.description)
        .bind(&resource.file_path)
        .bind(&resource.file_type)
        .bind(resource.owner_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_by_path(&self, file_path: &str) -> Result<Option<i64>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM resources WHERE file_path = ? ORDER BY id LIMIT 1")
                .bind(file_path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    async fn remove(&self, resource_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
