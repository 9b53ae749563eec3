//! Failure callback trigger.
//!
//! The worker runtime calls [`FailureCallback::on_failure`] when a job body
//! raises. The task id is recovered from the job's own arguments, so the
//! callback works without any extra bookkeeping on the worker side.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use taskwatch_core::{Clock, TaskId};

use crate::queue::QueueClient;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::store::TaskStore;

/// What the worker runtime knows about a failed job body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Error type name, e.g. `ValueError`
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl JobFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Build from a Rust error, using its bare type name.
    ///
    /// The name comes from the static type, so a type-erased `dyn Error`
    /// reports as `Error`. Workers holding one should call
    /// [`JobFailure::new`] with an explicit type name instead.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let full = std::any::type_name::<E>();
        let path = full.split('<').next().unwrap_or(full);
        let short = path.rsplit("::").next().unwrap_or(path);
        Self::new(short, err.to_string())
    }

    /// `"<ErrorType>: <message>"`, followed by the traceback when present.
    pub fn detail(&self) -> String {
        let mut detail = format!("{}: {}", self.error_type, self.message);
        if let Some(tb) = self.traceback.as_deref().filter(|tb| !tb.trim().is_empty()) {
            detail.push('\n');
            detail.push_str(tb);
        }
        detail
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallbackError {
    #[error("job arguments carry no task_id")]
    MissingTaskId,
    #[error("job arguments carry an invalid task_id: {0}")]
    InvalidTaskId(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Extract the task id from a job's arguments.
///
/// Accepted shapes: `{"task_id": "..."}`, or a positional argument list whose
/// first element is either the id itself or such an object.
pub fn task_id_from_args(args: &JsonValue) -> Result<TaskId, CallbackError> {
    let raw = match args {
        JsonValue::Object(map) => map.get("task_id"),
        JsonValue::Array(items) => match items.first() {
            Some(JsonValue::Object(map)) => map.get("task_id"),
            first => first,
        },
        _ => None,
    };

    match raw {
        None | Some(JsonValue::Null) => Err(CallbackError::MissingTaskId),
        Some(JsonValue::String(s)) => s
            .parse()
            .map_err(|e: taskwatch_core::DomainError| CallbackError::InvalidTaskId(e.to_string())),
        Some(other) => Err(CallbackError::InvalidTaskId(format!(
            "expected a string, got {other}"
        ))),
    }
}

pub struct FailureCallback<S, Q, C> {
    reconciler: Arc<Reconciler<S, Q, C>>,
}

impl<S, Q, C> Clone for FailureCallback<S, Q, C> {
    fn clone(&self) -> Self {
        Self {
            reconciler: self.reconciler.clone(),
        }
    }
}

impl<S, Q, C> FailureCallback<S, Q, C>
where
    S: TaskStore,
    Q: QueueClient,
    C: Clock,
{
    pub fn new(reconciler: Arc<Reconciler<S, Q, C>>) -> Self {
        Self { reconciler }
    }

    /// Handle a job-body failure reported by the worker runtime.
    ///
    /// Malformed arguments are logged and returned as an error; they never
    /// touch any record.
    pub async fn on_failure(
        &self,
        args: &JsonValue,
        failure: &JobFailure,
    ) -> Result<ReconcileOutcome, CallbackError> {
        let task_id = match task_id_from_args(args) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, error_type = %failure.error_type, "failure callback could not identify the task");
                return Err(e);
            }
        };

        let outcome = self
            .reconciler
            .reconcile_with_failure(task_id, &failure.detail())
            .await
            .inspect_err(|e| {
                warn!(task_id = %task_id, error = %e, "failure callback could not reconcile task");
            })?;

        info!(
            task_id = %task_id,
            error_type = %failure.error_type,
            outcome = outcome.as_str(),
            "job failure reported"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use taskwatch_core::{FailureKind, ManualClock, TaskRecord, TaskStatus, TimeoutPolicy};

    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryTaskStore;

    #[derive(Debug, thiserror::Error)]
    #[error("bad input")]
    struct ValueError;

    fn callback() -> (
        FailureCallback<Arc<InMemoryTaskStore>, Arc<InMemoryQueue>, ManualClock>,
        Arc<InMemoryTaskStore>,
        Arc<InMemoryQueue>,
    ) {
        let clock = ManualClock::new(Utc::now());
        let store = InMemoryTaskStore::arc();
        let queue = InMemoryQueue::arc(clock.clone(), Duration::from_secs(3600));
        let reconciler = Reconciler::new(store.clone(), queue.clone(), clock, TimeoutPolicy::none());
        (FailureCallback::new(Arc::new(reconciler)), store, queue)
    }

    #[test]
    fn task_id_from_keyword_and_positional_args() {
        let id = TaskId::new();
        assert_eq!(task_id_from_args(&json!({"task_id": id.to_string(), "x": 1})).unwrap(), id);
        assert_eq!(task_id_from_args(&json!([id.to_string(), 5])).unwrap(), id);
        assert_eq!(task_id_from_args(&json!([{"task_id": id.to_string()}])).unwrap(), id);
    }

    #[test]
    fn malformed_args_are_rejected() {
        assert!(matches!(task_id_from_args(&json!({})), Err(CallbackError::MissingTaskId)));
        assert!(matches!(task_id_from_args(&json!([])), Err(CallbackError::MissingTaskId)));
        assert!(matches!(
            task_id_from_args(&json!({"task_id": "not-a-uuid"})),
            Err(CallbackError::InvalidTaskId(_))
        ));
        assert!(matches!(
            task_id_from_args(&json!({"task_id": 42})),
            Err(CallbackError::InvalidTaskId(_))
        ));
    }

    #[test]
    fn failure_detail_from_rust_error() {
        let failure = JobFailure::from_error(&ValueError).with_traceback("  at step 3");
        assert_eq!(failure.error_type, "ValueError");
        assert_eq!(failure.detail(), "ValueError: bad input\n  at step 3");
    }

    #[test]
    fn type_erased_error_needs_an_explicit_name() {
        let erased: &dyn std::error::Error = &ValueError;
        assert_eq!(JobFailure::from_error(erased).error_type, "Error");

        let named = JobFailure::new("ValueError", erased.to_string());
        assert_eq!(named.detail(), "ValueError: bad input");
    }

    #[tokio::test]
    async fn raised_job_body_fails_the_running_task() {
        let (callback, store, queue) = callback();
        let record = TaskRecord::new("import", json!({}), Utc::now()).unwrap();
        let id = store.insert(record).await.unwrap();
        let handle = queue.dispatch(id, "import", &json!({})).await.unwrap();
        store.set_remote_handle(id, handle).await.unwrap();
        store.mark_running(id).await.unwrap();

        let outcome = callback
            .on_failure(
                &json!({"task_id": id.to_string()}),
                &JobFailure::new("ValueError", "bad input"),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::StoppedUnexpectedly
            }
        );
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        let user_message = record.error_message.unwrap();
        assert!(!user_message.contains("ValueError"));
        assert!(user_message.contains("contact support"));
        assert!(record.technical_detail.unwrap().contains("ValueError: bad input"));
    }

    #[tokio::test]
    async fn malformed_args_touch_nothing() {
        let (callback, store, _queue) = callback();
        let record = TaskRecord::new("import", json!({}), Utc::now()).unwrap();
        let id = store.insert(record.clone()).await.unwrap();

        let err = callback
            .on_failure(&json!({"other": 1}), &JobFailure::new("KeyError", "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, CallbackError::MissingTaskId));
        assert_eq!(store.get(id).await.unwrap().unwrap(), record);
    }
}
