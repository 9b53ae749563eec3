//! Postgres-backed task store.
//!
//! Every status change is a single conditional `UPDATE ... WHERE status = ANY(..)`
//! whose allowed source statuses come from [`TaskStatus::sources_of`]. Postgres
//! row locking serializes concurrent updates to one row, so of two racing
//! terminal writes exactly one matches its `WHERE` clause.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskStoreError |
//! |------------|----------------------|----------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (check violation) | `23514` | `Storage` |
//! | Database (other) | any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Rows that do not decode into a valid [`TaskRecord`] surface as `Corrupt`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use taskwatch_core::{RemoteHandle, TaskId, TaskRecord, TaskStatus, TerminalUpdate};

use super::{TaskStats, TaskStore, TaskStoreError, TransitionOutcome};

/// Schema applied by [`PostgresTaskStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_create_tasks.sql");

const TASK_COLUMNS: &str = r#"
    task_id,
    remote_handle,
    task_type,
    payload,
    status,
    created_at,
    completed_at,
    log_messages,
    error_message,
    technical_detail,
    result
"#;

/// Postgres-backed task store.
///
/// `Send + Sync` and cheap to clone; all access goes through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, TaskStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `tasks` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), TaskStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Classify a conditional update that matched no row.
    async fn unapplied(&self, task_id: TaskId) -> Result<TransitionOutcome, TaskStoreError> {
        let row = sqlx::query("SELECT status FROM tasks WHERE task_id = $1")
            .bind(task_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_status", e))?;

        let Some(row) = row else {
            return Ok(TransitionOutcome::NotFound);
        };
        let status: String = row
            .try_get("status")
            .map_err(|e| TaskStoreError::Corrupt(format!("failed to read status: {e}")))?;
        let current = parse_status(&status)?;
        Ok(TransitionOutcome::Rejected { current })
    }

    async fn outcome(
        &self,
        task_id: TaskId,
        rows_affected: u64,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        if rows_affected > 0 {
            Ok(TransitionOutcome::Applied)
        } else {
            self.unapplied(task_id).await
        }
    }

    /// Terminal write guarded on `sources`.
    async fn finish_where(
        &self,
        task_id: TaskId,
        sources: &[TaskStatus],
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        if !update.status.is_terminal() || sources.is_empty() {
            return self.unapplied(task_id).await;
        }

        // Same field rules as `TaskRecord::finish`.
        let error_message = update
            .error_message
            .filter(|_| update.status == TaskStatus::Failed);
        let result = update
            .result
            .filter(|_| update.status == TaskStatus::Completed);
        let new_logs: Vec<String> = update.log_message.into_iter().collect();

        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                completed_at = $3,
                error_message = $4,
                technical_detail = COALESCE($5, technical_detail),
                result = $6,
                log_messages = log_messages || $7::text[]
            WHERE task_id = $1
                AND status = ANY($8)
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(update.status.as_str())
        .bind(update.at)
        .bind(error_message)
        .bind(update.technical_detail)
        .bind(result)
        .bind(new_logs)
        .bind(status_names(sources))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_task", e))?;

        self.outcome(task_id, done.rows_affected()).await
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, record), fields(task_id = %record.task_id, task_type = %record.task_type), err)]
    async fn insert(&self, record: TaskRecord) -> Result<TaskId, TaskStoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id,
                remote_handle,
                task_type,
                payload,
                status,
                created_at,
                completed_at,
                log_messages,
                error_message,
                technical_detail,
                result
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.task_id.as_uuid())
        .bind(record.remote_handle.as_ref().map(|h| h.as_str()))
        .bind(&record.task_type)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(&record.log_messages)
        .bind(record.error_message.as_deref())
        .bind(record.technical_detail.as_deref())
        .bind(record.result.as_ref())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TaskStoreError::AlreadyExists(record.task_id)
            } else {
                map_sqlx_error("insert_task", e)
            }
        })?;

        Ok(record.task_id)
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = $1"))
            .bind(task_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), fields(task_id = %task_id, remote_handle = %handle), err)]
    async fn set_remote_handle(
        &self,
        task_id: TaskId,
        handle: RemoteHandle,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET remote_handle = $2
            WHERE task_id = $1
                AND remote_handle IS NULL
                AND status = ANY($3)
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(handle.as_str())
        .bind(status_names(&TaskStatus::NON_TERMINAL))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_remote_handle", e))?;

        self.outcome(task_id, done.rows_affected()).await
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn mark_running(&self, task_id: TaskId) -> Result<TransitionOutcome, TaskStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2
            WHERE task_id = $1
                AND remote_handle IS NOT NULL
                AND status = ANY($3)
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(TaskStatus::Running.as_str())
        .bind(status_names(TaskStatus::sources_of(TaskStatus::Running)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_running", e))?;

        self.outcome(task_id, done.rows_affected()).await
    }

    #[instrument(skip(self, message), fields(task_id = %task_id), err)]
    async fn append_log(
        &self,
        task_id: TaskId,
        message: String,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET log_messages = array_append(log_messages, $2)
            WHERE task_id = $1
                AND status = ANY($3)
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(message)
        .bind(status_names(&TaskStatus::NON_TERMINAL))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;

        self.outcome(task_id, done.rows_affected()).await
    }

    #[instrument(skip(self, update), fields(task_id = %task_id, status = %update.status), err)]
    async fn finish(
        &self,
        task_id: TaskId,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        let sources = TaskStatus::sources_of(update.status);
        self.finish_where(task_id, sources, update).await
    }

    #[instrument(skip(self, update), fields(task_id = %task_id, from = %from, status = %update.status), err)]
    async fn finish_from(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        if !from.can_transition_to(update.status) {
            return self.unapplied(task_id).await;
        }
        self.finish_where(task_id, std::slice::from_ref(&from), update)
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_non_terminal(&self) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ANY($1) ORDER BY created_at ASC, task_id ASC"
        ))
        .bind(status_names(&TaskStatus::NON_TERMINAL))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_non_terminal", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("task_stats", e))?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| TaskStoreError::Corrupt(format!("failed to read status: {e}")))?;
            let count: i64 = row
                .try_get("n")
                .map_err(|e| TaskStoreError::Corrupt(format!("failed to read count: {e}")))?;
            stats.record(parse_status(&status)?, count.max(0) as usize);
        }
        Ok(stats)
    }
}

fn status_names(statuses: &[TaskStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

fn parse_status(raw: &str) -> Result<TaskStatus, TaskStoreError> {
    raw.parse()
        .map_err(|e| TaskStoreError::Corrupt(format!("bad status {raw:?}: {e}")))
}

fn decode_row(row: &PgRow) -> Result<TaskRecord, TaskStoreError> {
    TaskRow::from_row(row)
        .map_err(|e| TaskStoreError::Corrupt(format!("failed to deserialize task row: {e}")))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => TaskStoreError::Storage(format!("{msg} (check constraint)")),
                _ => TaskStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => TaskStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    task_id: uuid::Uuid,
    remote_handle: Option<String>,
    task_type: String,
    payload: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    log_messages: Vec<String>,
    error_message: Option<String>,
    technical_detail: Option<String>,
    result: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            task_id: row.try_get("task_id")?,
            remote_handle: row.try_get("remote_handle")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
            log_messages: row.try_get("log_messages")?,
            error_message: row.try_get("error_message")?,
            technical_detail: row.try_get("technical_detail")?,
            result: row.try_get("result")?,
        })
    }
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let remote_handle = row
            .remote_handle
            .map(RemoteHandle::new)
            .transpose()
            .map_err(|e| TaskStoreError::Corrupt(format!("bad remote handle: {e}")))?;

        Ok(TaskRecord {
            task_id: TaskId::from_uuid(row.task_id),
            remote_handle,
            task_type: row.task_type,
            payload: row.payload,
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            completed_at: row.completed_at,
            log_messages: row.log_messages,
            error_message: row.error_message,
            technical_detail: row.technical_detail,
            result: row.result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> TaskRow {
        TaskRow {
            task_id: uuid::Uuid::now_v7(),
            remote_handle: Some("h-1".to_string()),
            task_type: "export".to_string(),
            payload: serde_json::json!({"a": 1}),
            status: status.to_string(),
            created_at: Utc::now(),
            completed_at: None,
            log_messages: vec!["queued".to_string()],
            error_message: None,
            technical_detail: None,
            result: None,
        }
    }

    #[test]
    fn decodes_a_valid_row() {
        let record = TaskRecord::try_from(row("running")).unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.remote_handle.unwrap().as_str(), "h-1");
        assert_eq!(record.log_messages, vec!["queued".to_string()]);
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let err = TaskRecord::try_from(row("zombie")).unwrap_err();
        assert!(matches!(err, TaskStoreError::Corrupt(_)));
    }

    #[test]
    fn blank_handle_is_corrupt() {
        let mut r = row("pending");
        r.remote_handle = Some("   ".to_string());
        assert!(matches!(
            TaskRecord::try_from(r),
            Err(TaskStoreError::Corrupt(_))
        ));
    }

    #[test]
    fn conditional_writes_use_the_lifecycle_graph() {
        assert_eq!(
            status_names(TaskStatus::sources_of(TaskStatus::Failed)),
            vec!["pending", "running"]
        );
        assert_eq!(
            status_names(TaskStatus::sources_of(TaskStatus::Completed)),
            vec!["running"]
        );
    }

    #[test]
    fn schema_enforces_completed_at_iff_terminal() {
        assert!(SCHEMA.contains("tasks_completed_at_iff_terminal"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS tasks"));
    }
}
