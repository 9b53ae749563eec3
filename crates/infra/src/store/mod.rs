//! Task record persistence.
//!
//! Pure data access, no policy: the store never decides *whether* a task
//! should change, only applies a change when the record is still in a state
//! that allows it. Every status write is conditional ("only if the current
//! status may still move to the target"), which is the one synchronization
//! primitive the rest of the subsystem relies on.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use taskwatch_core::{RemoteHandle, TaskId, TaskRecord, TaskStatus, TerminalUpdate};

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

/// Result of a conditional write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The write was persisted.
    Applied,
    /// The record exists but its current state does not allow the write.
    /// For concurrent terminal writes this is the losing side.
    Rejected { current: TaskStatus },
    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("corrupt task row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus, count: usize) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new record.
    async fn insert(&self, record: TaskRecord) -> Result<TaskId, TaskStoreError>;

    /// Fetch a snapshot of a record. `None` is an ordinary outcome.
    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError>;

    /// Record the queue handle; only once, and only while non-terminal.
    async fn set_remote_handle(
        &self,
        task_id: TaskId,
        handle: RemoteHandle,
    ) -> Result<TransitionOutcome, TaskStoreError>;

    /// PENDING -> RUNNING; requires a remote handle.
    async fn mark_running(&self, task_id: TaskId) -> Result<TransitionOutcome, TaskStoreError>;

    /// Append a progress line while the record is non-terminal.
    async fn append_log(
        &self,
        task_id: TaskId,
        message: String,
    ) -> Result<TransitionOutcome, TaskStoreError>;

    /// Conditional terminal write. At most one succeeds per record.
    async fn finish(
        &self,
        task_id: TaskId,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError>;

    /// Terminal write that only lands while the record is still in `from`.
    ///
    /// For decisions taken on a snapshot: if the record moved in the
    /// meantime the write is rejected with the newer status.
    async fn finish_from(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError>;

    /// All PENDING and RUNNING records, oldest first.
    async fn list_non_terminal(&self) -> Result<Vec<TaskRecord>, TaskStoreError>;

    async fn stats(&self) -> Result<TaskStats, TaskStoreError>;
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn insert(&self, record: TaskRecord) -> Result<TaskId, TaskStoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError> {
        (**self).get(task_id).await
    }

    async fn set_remote_handle(
        &self,
        task_id: TaskId,
        handle: RemoteHandle,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        (**self).set_remote_handle(task_id, handle).await
    }

    async fn mark_running(&self, task_id: TaskId) -> Result<TransitionOutcome, TaskStoreError> {
        (**self).mark_running(task_id).await
    }

    async fn append_log(
        &self,
        task_id: TaskId,
        message: String,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        (**self).append_log(task_id, message).await
    }

    async fn finish(
        &self,
        task_id: TaskId,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        (**self).finish(task_id, update).await
    }

    async fn finish_from(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        (**self).finish_from(task_id, from, update).await
    }

    async fn list_non_terminal(&self) -> Result<Vec<TaskRecord>, TaskStoreError> {
        (**self).list_non_terminal().await
    }

    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        (**self).stats().await
    }
}
