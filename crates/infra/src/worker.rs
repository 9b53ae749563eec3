//! Job-body side of the lifecycle.
//!
//! A job body gets a [`TaskReporter`] for its task and uses it to mark the
//! start, stream progress lines and record the final outcome. Completion is
//! only ever written from here.

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use taskwatch_core::{Clock, TaskId, TerminalUpdate};

use crate::store::{TaskStore, TaskStoreError, TransitionOutcome};

#[derive(Debug, Clone)]
pub struct TaskReporter<S, C> {
    store: S,
    clock: C,
    task_id: TaskId,
}

impl<S, C> TaskReporter<S, C>
where
    S: TaskStore,
    C: Clock,
{
    pub fn new(store: S, clock: C, task_id: TaskId) -> Self {
        Self {
            store,
            clock,
            task_id,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// PENDING -> RUNNING.
    pub async fn start(&self) -> Result<TransitionOutcome, TaskStoreError> {
        let outcome = self.store.mark_running(self.task_id).await?;
        self.log_outcome("start", outcome);
        Ok(outcome)
    }

    /// Append a progress line.
    pub async fn log(&self, message: impl Into<String>) -> Result<TransitionOutcome, TaskStoreError> {
        let outcome = self.store.append_log(self.task_id, message.into()).await?;
        if !outcome.is_applied() {
            debug!(task_id = %self.task_id, ?outcome, "progress line dropped");
        }
        Ok(outcome)
    }

    /// RUNNING -> COMPLETED with the job's result.
    pub async fn complete(&self, result: JsonValue) -> Result<TransitionOutcome, TaskStoreError> {
        let update = TerminalUpdate::completed(self.clock.now(), result).with_log("Task completed");
        let outcome = self.store.finish(self.task_id, update).await?;
        self.log_outcome("complete", outcome);
        Ok(outcome)
    }

    /// Record a failure the job body detected itself.
    pub async fn fail(
        &self,
        user_message: impl Into<String>,
        technical_detail: impl Into<String>,
    ) -> Result<TransitionOutcome, TaskStoreError> {
        let update = TerminalUpdate::failed(self.clock.now(), user_message, technical_detail)
            .with_log("Task failed");
        let outcome = self.store.finish(self.task_id, update).await?;
        self.log_outcome("fail", outcome);
        Ok(outcome)
    }

    /// True once the record is terminal (e.g. cancelled or failed by the
    /// reconciler); a cooperative job body should stop working.
    pub async fn should_stop(&self) -> Result<bool, TaskStoreError> {
        Ok(self
            .store
            .get(self.task_id)
            .await?
            .is_none_or(|record| record.is_terminal()))
    }

    fn log_outcome(&self, action: &'static str, outcome: TransitionOutcome) {
        match outcome {
            TransitionOutcome::Applied => info!(task_id = %self.task_id, action, "task updated by job body"),
            TransitionOutcome::Rejected { current } => warn!(
                task_id = %self.task_id,
                action,
                current = %current,
                "job body update rejected"
            ),
            TransitionOutcome::NotFound => warn!(task_id = %self.task_id, action, "job body reported on unknown task"),
        }
    }
}
