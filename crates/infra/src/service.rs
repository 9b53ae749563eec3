//! Submission, cancellation and status polling.
//!
//! `TaskService` is the entry point the HTTP layer (or any other caller)
//! uses. It owns one shared [`Reconciler`]; the sweeper, the failure
//! callback and job-body reporters are all derived from it, so every trigger
//! sees the same store, queue, clock and timeout.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use taskwatch_core::{
    Clock, FailureKind, TaskId, TaskRecord, TaskStatus, TerminalUpdate, TimeoutPolicy,
};

use crate::callback::FailureCallback;
use crate::queue::{QueueClient, QueueError};
use crate::reconciler::Reconciler;
use crate::store::{TaskStats, TaskStore, TaskStoreError, TransitionOutcome};
use crate::sweeper::{Sweeper, SweeperConfig};
use crate::worker::TaskReporter;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[source] QueueError),
}

/// Result of a cancellation request on an existing task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The record is now CANCELLED. `revoked` is whether the queue
    /// acknowledged the revoke.
    Cancelled { revoked: bool },
    /// Nothing to cancel; the task had already finished.
    AlreadyTerminal { status: TaskStatus },
}

pub struct TaskService<S, Q, C> {
    reconciler: Arc<Reconciler<S, Q, C>>,
}

impl<S, Q, C> Clone for TaskService<S, Q, C> {
    fn clone(&self) -> Self {
        Self {
            reconciler: self.reconciler.clone(),
        }
    }
}

impl<S, Q, C> TaskService<S, Q, C>
where
    S: TaskStore,
    Q: QueueClient,
    C: Clock,
{
    pub fn new(store: S, queue: Q, clock: C, timeout: TimeoutPolicy) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(store, queue, clock, timeout)),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<S, Q, C>> {
        &self.reconciler
    }

    pub fn failure_callback(&self) -> FailureCallback<S, Q, C> {
        FailureCallback::new(self.reconciler.clone())
    }

    /// Create a PENDING record and hand the job to the queue.
    #[instrument(skip(self, payload), fields(task_type = %task_type), err)]
    pub async fn submit(&self, task_type: &str, payload: JsonValue) -> Result<TaskId, ServiceError> {
        let store = self.reconciler.store();
        let queue = self.reconciler.queue();
        let clock = self.reconciler.clock();

        let record = TaskRecord::new(task_type, payload, clock.now())
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        let task_id = store.insert(record.clone()).await?;

        let handle = match queue.dispatch(task_id, &record.task_type, &record.payload).await {
            Ok(handle) => handle,
            Err(e) => {
                let update = TerminalUpdate::failed(
                    clock.now(),
                    FailureKind::FailedToStart.user_message(),
                    format!("dispatch failed: {e}"),
                )
                .with_log("Task failed to start");
                let outcome = store.finish(task_id, update).await?;
                warn!(task_id = %task_id, error = %e, ?outcome, "task could not be dispatched");
                return Err(ServiceError::Dispatch(e));
            }
        };

        match store.set_remote_handle(task_id, handle.clone()).await? {
            TransitionOutcome::Applied => {}
            TransitionOutcome::Rejected { current } if current.is_terminal() => {
                // Cancelled (or failed) while dispatch was in flight; the
                // cancel had no handle to revoke, so revoke here.
                match queue.revoke(&handle).await {
                    Ok(revoked) => {
                        info!(task_id = %task_id, remote_handle = %handle, status = %current, revoked, "task finished during dispatch; job revoked");
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, remote_handle = %handle, status = %current, error = %e, "task finished during dispatch; revoke failed");
                    }
                }
                return Ok(task_id);
            }
            outcome => {
                warn!(task_id = %task_id, remote_handle = %handle, ?outcome, "remote handle not recorded");
            }
        }

        info!(task_id = %task_id, task_type = %record.task_type, remote_handle = %handle, "task submitted");
        Ok(task_id)
    }

    /// Cancel a task: best-effort revoke, then a guarded CANCELLED write.
    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, ServiceError> {
        let store = self.reconciler.store();

        let Some(record) = store.get(task_id).await? else {
            return Err(ServiceError::NotFound(task_id));
        };
        if record.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal {
                status: record.status,
            });
        }

        let mut revoked = false;
        if let Some(handle) = &record.remote_handle {
            match self.reconciler.queue().revoke(handle).await {
                Ok(ack) => revoked = ack,
                Err(e) => {
                    warn!(task_id = %task_id, remote_handle = %handle, error = %e, "revoke failed; cancelling anyway");
                }
            }
        }

        let update = TerminalUpdate::cancelled(self.reconciler.clock().now()).with_log("Task cancelled");
        match store.finish(task_id, update).await? {
            TransitionOutcome::Applied => {
                info!(task_id = %task_id, revoked, "task cancelled");
                Ok(CancelOutcome::Cancelled { revoked })
            }
            TransitionOutcome::Rejected { current } => {
                Ok(CancelOutcome::AlreadyTerminal { status: current })
            }
            TransitionOutcome::NotFound => Err(ServiceError::NotFound(task_id)),
        }
    }

    /// Reconcile on demand, then return the fresh record.
    ///
    /// Reconciliation errors are logged and otherwise ignored; the caller
    /// still gets the stored record.
    pub async fn get_status(&self, task_id: TaskId) -> Result<Option<TaskRecord>, ServiceError> {
        match self.reconciler.reconcile(task_id).await {
            Ok(outcome) => debug!(task_id = %task_id, outcome = outcome.as_str(), "on-demand reconcile"),
            Err(e) => warn!(task_id = %task_id, error = %e, "on-demand reconcile failed"),
        }
        Ok(self.reconciler.store().get(task_id).await?)
    }

    pub async fn stats(&self) -> Result<TaskStats, ServiceError> {
        Ok(self.reconciler.store().stats().await?)
    }
}

impl<S, Q, C> TaskService<S, Q, C>
where
    S: TaskStore + Clone,
    Q: QueueClient,
    C: Clock + Clone,
{
    /// Reporter a job body uses for `task_id`.
    pub fn reporter(&self, task_id: TaskId) -> TaskReporter<S, C> {
        TaskReporter::new(
            self.reconciler.store().clone(),
            self.reconciler.clock().clone(),
            task_id,
        )
    }
}

impl<S, Q, C> TaskService<S, Q, C>
where
    S: TaskStore + 'static,
    Q: QueueClient + 'static,
    C: Clock,
{
    pub fn sweeper(&self, config: SweeperConfig) -> Sweeper<S, Q, C> {
        Sweeper::new(self.reconciler.clone(), config)
    }
}
