//! In-memory task store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use taskwatch_core::{
    DomainError, DomainResult, RemoteHandle, TaskId, TaskRecord, TaskStatus, TerminalUpdate,
};

use super::{TaskStats, TaskStore, TaskStoreError, TransitionOutcome};

/// In-memory task store.
///
/// Conditional writes are check-and-set under the write lock, so concurrent
/// writers to the same record serialize and only the first valid one lands.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Run a lifecycle method against the stored record.
    ///
    /// The record methods validate before mutating, so a rejected change
    /// leaves the stored record untouched.
    fn modify<F>(&self, task_id: TaskId, change: F) -> Result<TransitionOutcome, TaskStoreError>
    where
        F: FnOnce(&mut TaskRecord) -> DomainResult<()>,
    {
        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))?;

        let Some(record) = tasks.get_mut(&task_id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        match change(record) {
            Ok(()) => Ok(TransitionOutcome::Applied),
            Err(_) => Ok(TransitionOutcome::Rejected {
                current: record.status,
            }),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskId, TaskStoreError> {
        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))?;
        if tasks.contains_key(&record.task_id) {
            return Err(TaskStoreError::AlreadyExists(record.task_id));
        }
        let id = record.task_id;
        tasks.insert(id, record);
        Ok(id)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))?;
        Ok(tasks.get(&task_id).cloned())
    }

    async fn set_remote_handle(
        &self,
        task_id: TaskId,
        handle: RemoteHandle,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        self.modify(task_id, |r| r.assign_remote_handle(handle))
    }

    async fn mark_running(&self, task_id: TaskId) -> Result<TransitionOutcome, TaskStoreError> {
        self.modify(task_id, |r| r.start())
    }

    async fn append_log(
        &self,
        task_id: TaskId,
        message: String,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        self.modify(task_id, |r| r.append_log(message))
    }

    async fn finish(
        &self,
        task_id: TaskId,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        self.modify(task_id, |r| r.finish(update))
    }

    async fn finish_from(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        update: TerminalUpdate,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        self.modify(task_id, |r| {
            if r.status != from {
                return Err(DomainError::invariant(format!(
                    "task {} is {}, expected {}",
                    r.task_id, r.status, from
                )));
            }
            r.finish(update)
        })
    }

    async fn list_non_terminal(&self) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.created_at, r.task_id));
        Ok(result)
    }

    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))?;
        let mut stats = TaskStats::default();
        for record in tasks.values() {
            stats.record(record.status, 1);
        }
        Ok(stats)
    }
}
