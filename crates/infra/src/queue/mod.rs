//! Boundary to the remote job queue.
//!
//! The rest of the subsystem only ever sees the coarse [`RemoteState`] enum
//! plus an optional failure string; broker-specific states are mapped inside
//! the implementation.

#[cfg(test)]
pub(crate) mod gated;
pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use taskwatch_core::{RemoteHandle, RemoteState, TaskId};

pub use in_memory::InMemoryQueue;

/// Queue client error.
///
/// Every variant is treated as transient by the callers: nothing is written
/// to a record because the queue could not be asked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Hand a job to the queue, returning its handle.
    async fn dispatch(
        &self,
        task_id: TaskId,
        task_type: &str,
        payload: &JsonValue,
    ) -> Result<RemoteHandle, QueueError>;

    /// What the queue currently knows about the handle.
    async fn remote_state(&self, handle: &RemoteHandle) -> Result<RemoteState, QueueError>;

    /// Error text the queue kept for a failed job, if any.
    async fn failure_detail(&self, handle: &RemoteHandle) -> Result<Option<String>, QueueError>;

    /// Ask the queue to drop or stop the job. Best-effort; `true` when the
    /// queue acknowledged the revoke.
    async fn revoke(&self, handle: &RemoteHandle) -> Result<bool, QueueError>;
}

#[async_trait]
impl<Q> QueueClient for Arc<Q>
where
    Q: QueueClient + ?Sized,
{
    async fn dispatch(
        &self,
        task_id: TaskId,
        task_type: &str,
        payload: &JsonValue,
    ) -> Result<RemoteHandle, QueueError> {
        (**self).dispatch(task_id, task_type, payload).await
    }

    async fn remote_state(&self, handle: &RemoteHandle) -> Result<RemoteState, QueueError> {
        (**self).remote_state(handle).await
    }

    async fn failure_detail(&self, handle: &RemoteHandle) -> Result<Option<String>, QueueError> {
        (**self).failure_detail(handle).await
    }

    async fn revoke(&self, handle: &RemoteHandle) -> Result<bool, QueueError> {
        (**self).revoke(handle).await
    }
}
