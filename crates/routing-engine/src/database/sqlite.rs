//! SQLite task repository

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::TaskRepository;
use crate::error::{Result, RoutingError};
use crate::queue::{QueuedTask, TaskId};

/// [`TaskRepository`] backed by a SQLite database
///
/// Ordering and step columns are stored next to the JSON-encoded task so the
/// table can be inspected and step updates do not rewrite the payload.
#[derive(Debug, Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database and ensure the schema exists
    ///
    /// `sqlite::memory:` is opened with a single connection so every query
    /// sees the same in-memory database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let repository = Self::new(pool);
        repository.initialize().await?;
        info!("Task repository ready at {}", database_url);
        Ok(repository)
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queued_tasks (
                task_id TEXT PRIMARY KEY,
                queue_id TEXT NOT NULL,
                priority INTEGER NOT NULL,
                enqueued_at_ms INTEGER NOT NULL,
                step_index INTEGER NOT NULL,
                step_started_at_ms INTEGER NOT NULL,
                payload TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RoutingError::repository(format!("invalid timestamp {}", ms)))
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn save(&self, task: &QueuedTask) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        sqlx::query(
            "INSERT OR REPLACE INTO queued_tasks
             (task_id, queue_id, priority, enqueued_at_ms, step_index, step_started_at_ms, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.task_id.as_ref())
        .bind(task.queue_id.as_ref())
        .bind(task.priority as i64)
        .bind(task.enqueued_at.timestamp_millis())
        .bind(task.step_index as i64)
        .bind(task.step_started_at.timestamp_millis())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        debug!("Persisted task {}", task.task_id);
        Ok(())
    }

    async fn update_step(
        &self,
        task_id: &TaskId,
        step_index: usize,
        step_started_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE queued_tasks SET step_index = ?, step_started_at_ms = ? WHERE task_id = ?",
        )
        .bind(step_index as i64)
        .bind(step_started_at.timestamp_millis())
        .bind(task_id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, task_id: &TaskId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queued_tasks WHERE task_id = ?")
            .bind(task_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_all(&self) -> Result<Vec<QueuedTask>> {
        let rows = sqlx::query(
            "SELECT payload, step_index, step_started_at_ms FROM queued_tasks
             ORDER BY priority DESC, enqueued_at_ms ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            let mut task: QueuedTask = serde_json::from_str(&payload)?;
            let step_index: i64 = row.try_get("step_index")?;
            task.step_index = step_index.max(0) as usize;
            task.step_started_at = from_millis(row.try_get("step_started_at_ms")?)?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}
