//! Reconciler: detect tasks whose local record says "alive" but that are in
//! fact dead, and fail them.
//!
//! Safe to call any number of times, from any number of triggers at once
//! (status poll, periodic sweep, failure callback). The only write it ever
//! issues is a conditional FAILED transition; whichever writer loses the race
//! sees [`ReconcileOutcome::LostRace`].

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use taskwatch_core::reconcile::{decide, decide_known_failure};
use taskwatch_core::{
    Clock, Decision, FailureKind, FailureReport, LeaveReason, RemoteHandle, RemoteState,
    TaskId, TaskStatus, TimeoutPolicy,
};

use crate::queue::{QueueClient, QueueError};
use crate::store::{TaskStore, TaskStoreError, TransitionOutcome};

/// What a single reconciliation did.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// No record with that id
    NotFound,
    /// Record was already terminal; nothing to do
    AlreadyTerminal { status: TaskStatus },
    /// Record is (as far as we can tell) still alive
    Left { reason: LeaveReason },
    /// This call wrote the FAILED transition
    Failed { kind: FailureKind },
    /// Another writer changed the record first
    LostRace { current: TaskStatus },
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::NotFound => "not_found",
            ReconcileOutcome::AlreadyTerminal { .. } => "already_terminal",
            ReconcileOutcome::Left { .. } => "left",
            ReconcileOutcome::Failed { .. } => "failed",
            ReconcileOutcome::LostRace { .. } => "lost_race",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Reconciles local task records against the remote queue.
#[derive(Debug, Clone)]
pub struct Reconciler<S, Q, C> {
    store: S,
    queue: Q,
    clock: C,
    timeout: TimeoutPolicy,
}

impl<S, Q, C> Reconciler<S, Q, C>
where
    S: TaskStore,
    Q: QueueClient,
    C: Clock,
{
    pub fn new(store: S, queue: Q, clock: C, timeout: TimeoutPolicy) -> Self {
        Self {
            store,
            queue,
            clock,
            timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn timeout(&self) -> TimeoutPolicy {
        self.timeout
    }

    /// Reconcile one task by asking the queue about it.
    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub async fn reconcile(&self, task_id: TaskId) -> Result<ReconcileOutcome, ReconcileError> {
        match self.run(task_id, None).await? {
            // PENDING -> RUNNING under our feet; the decision is stale.
            ReconcileOutcome::LostRace { current } if !current.is_terminal() => {
                debug!(task_id = %task_id, current = %current, "task moved while reconciling; deciding again");
                self.run(task_id, None).await
            }
            outcome => Ok(outcome),
        }
    }

    /// Reconcile one task whose job body is already known to have failed.
    ///
    /// The queue is not consulted; `failure_detail` becomes the technical
    /// detail of the FAILED record.
    #[instrument(skip(self, failure_detail), fields(task_id = %task_id), err)]
    pub async fn reconcile_with_failure(
        &self,
        task_id: TaskId,
        failure_detail: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.run(task_id, Some(failure_detail)).await
    }

    async fn run(
        &self,
        task_id: TaskId,
        known_failure: Option<&str>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(record) = self.store.get(task_id).await? else {
            debug!(task_id = %task_id, "no task record to reconcile");
            return Ok(ReconcileOutcome::NotFound);
        };

        if record.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal {
                status: record.status,
            });
        }

        let now = self.clock.now();

        // Timeout wins over whatever the queue would say.
        if let Some(limit) = self.timeout.limit {
            if self.timeout.is_expired(record.created_at, now) {
                let report = FailureReport::timed_out(limit, record.created_at, now);
                return self.write_failure(task_id, None, report).await;
            }
        }

        if let Some(detail) = known_failure {
            return match decide_known_failure(record.status) {
                Decision::Fail(kind) => {
                    let report = FailureReport::reported_by_worker(kind, detail);
                    self.write_failure(task_id, None, report).await
                }
                Decision::Leave(reason) => Ok(ReconcileOutcome::Left { reason }),
            };
        }

        let Some(handle) = record.remote_handle else {
            // Dispatch still in flight.
            debug!(task_id = %task_id, "task has no remote handle yet");
            return Ok(ReconcileOutcome::Left {
                reason: LeaveReason::AwaitingProgress,
            });
        };

        let remote = self.queue.remote_state(&handle).await?;
        match decide(record.status, remote) {
            Decision::Leave(reason) => {
                debug!(
                    task_id = %task_id,
                    status = %record.status,
                    remote_state = %remote,
                    "task left alone"
                );
                Ok(ReconcileOutcome::Left { reason })
            }
            Decision::Fail(kind) => {
                let detail = self.remote_failure_detail(&handle, remote).await;
                let report = FailureReport::from_remote(kind, remote, detail.as_deref());
                self.write_failure(task_id, Some(record.status), report).await
            }
        }
    }

    /// Best-effort: an error here only loses diagnostics.
    async fn remote_failure_detail(
        &self,
        handle: &RemoteHandle,
        remote: RemoteState,
    ) -> Option<String> {
        if !remote.is_dead() {
            return None;
        }
        match self.queue.failure_detail(handle).await {
            Ok(detail) => detail,
            Err(e) => {
                warn!(remote_handle = %handle, error = %e, "could not fetch remote failure detail");
                None
            }
        }
    }

    /// Conditional FAILED write. With `from`, the write only lands while the
    /// record is still in the status the decision was made on.
    async fn write_failure(
        &self,
        task_id: TaskId,
        from: Option<TaskStatus>,
        report: FailureReport,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let kind = report.kind;
        let technical_detail = report.technical_detail.clone();
        let update = report.into_update(self.clock.now());

        let written = match from {
            Some(from) => self.store.finish_from(task_id, from, update).await?,
            None => self.store.finish(task_id, update).await?,
        };
        let outcome = match written {
            TransitionOutcome::Applied => {
                warn!(
                    task_id = %task_id,
                    failure = ?kind,
                    technical_detail = %technical_detail,
                    "task marked failed"
                );
                ReconcileOutcome::Failed { kind }
            }
            TransitionOutcome::Rejected { current } => {
                info!(
                    task_id = %task_id,
                    current = %current,
                    "task changed concurrently; failure not written"
                );
                ReconcileOutcome::LostRace { current }
            }
            TransitionOutcome::NotFound => ReconcileOutcome::NotFound,
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use taskwatch_core::{ManualClock, TaskRecord, TerminalUpdate};

    use super::*;
    use crate::queue::gated::{GatedCall, GatedQueue};
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryTaskStore;

    type TestReconciler = Reconciler<Arc<InMemoryTaskStore>, Arc<InMemoryQueue>, ManualClock>;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        queue: Arc<InMemoryQueue>,
        clock: ManualClock,
        reconciler: TestReconciler,
    }

    fn fixture(timeout: TimeoutPolicy) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let store = InMemoryTaskStore::arc();
        let queue = InMemoryQueue::arc(clock.clone(), Duration::from_secs(24 * 3600));
        let reconciler = Reconciler::new(store.clone(), queue.clone(), clock.clone(), timeout);
        Fixture {
            store,
            queue,
            clock,
            reconciler,
        }
    }

    impl Fixture {
        async fn dispatched(&self) -> (TaskId, RemoteHandle) {
            let record = TaskRecord::new("report", json!({"n": 1}), self.clock.now()).unwrap();
            let id = self.store.insert(record).await.unwrap();
            let handle = self
                .queue
                .dispatch(id, "report", &json!({"n": 1}))
                .await
                .unwrap();
            self.store
                .set_remote_handle(id, handle.clone())
                .await
                .unwrap();
            (id, handle)
        }

        async fn running(&self) -> (TaskId, RemoteHandle) {
            let (id, handle) = self.dispatched().await;
            self.queue.set_state(&handle, RemoteState::Started);
            self.store.mark_running(id).await.unwrap();
            (id, handle)
        }

        async fn record(&self, id: TaskId) -> TaskRecord {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let f = fixture(TimeoutPolicy::none());
        let outcome = f.reconciler.reconcile(TaskId::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotFound);
    }

    #[tokio::test]
    async fn remote_success_never_completes_the_record() {
        let f = fixture(TimeoutPolicy::none());
        let (id, handle) = f.running().await;
        f.queue.set_state(&handle, RemoteState::Success);

        for _ in 0..2 {
            let outcome = f.reconciler.reconcile(id).await.unwrap();
            assert_eq!(
                outcome,
                ReconcileOutcome::Left {
                    reason: LeaveReason::CompletionPending
                }
            );
        }
        assert_eq!(f.record(id).await.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn running_task_forgotten_by_the_queue_is_failed() {
        let f = fixture(TimeoutPolicy::none());
        let (id, _handle) = f.running().await;

        // Worker crashed and the backend expired the entry.
        f.clock.advance(chrono::Duration::hours(25));

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::Vanished
            }
        );

        let record = f.record(id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.completed_at.is_some());
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("Task stopped unexpectedly.")
        );
        assert!(
            record
                .technical_detail
                .as_deref()
                .unwrap()
                .contains("no record found at the remote system")
        );
    }

    #[tokio::test]
    async fn pending_task_unknown_to_the_queue_is_left_alone() {
        let f = fixture(TimeoutPolicy::none());
        let (id, handle) = f.dispatched().await;
        f.queue.forget(&handle);

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Left {
                reason: LeaveReason::AwaitingProgress
            }
        );
        assert_eq!(f.record(id).await.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn pending_task_without_handle_is_left_alone() {
        let f = fixture(TimeoutPolicy::none());
        let record = TaskRecord::new("report", json!({}), f.clock.now()).unwrap();
        let id = f.store.insert(record).await.unwrap();

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Left { .. }));
    }

    #[tokio::test]
    async fn pending_task_revoked_remotely_failed_to_start() {
        let f = fixture(TimeoutPolicy::none());
        let (id, handle) = f.dispatched().await;
        f.queue.set_state(&handle, RemoteState::Rejected);

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::FailedToStart
            }
        );
        assert_eq!(f.record(id).await.technical_detail.as_deref(), Some("remote state REJECTED"));
    }

    #[tokio::test]
    async fn remote_failure_detail_is_recorded() {
        let f = fixture(TimeoutPolicy::none());
        let (id, handle) = f.running().await;
        f.queue.fail(&handle, "MemoryError: out of memory");

        f.reconciler.reconcile(id).await.unwrap();

        let record = f.record(id).await;
        assert_eq!(
            record.technical_detail.as_deref(),
            Some("remote state FAILURE; MemoryError: out of memory")
        );
        assert!(!record.error_message.unwrap().contains("MemoryError"));
    }

    #[tokio::test]
    async fn timeout_takes_priority_over_a_live_remote_state() {
        let f = fixture(TimeoutPolicy::after(Duration::from_secs(3600)));
        let (id, _handle) = f.running().await;

        f.clock.advance(chrono::Duration::minutes(61));

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::TimedOut
            }
        );
        let record = f.record(id).await;
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("Task exceeded its time limit.")
        );
        assert!(record.technical_detail.unwrap().contains("3600s"));
    }

    #[tokio::test]
    async fn timeout_applies_even_when_the_queue_is_down() {
        let f = fixture(TimeoutPolicy::after(Duration::from_secs(60)));
        let (id, _handle) = f.dispatched().await;
        f.queue.set_available(false);
        f.clock.advance(chrono::Duration::seconds(61));

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::TimedOut
            }
        );
    }

    #[tokio::test]
    async fn queue_outage_is_an_error_and_changes_nothing() {
        let f = fixture(TimeoutPolicy::none());
        let (id, _handle) = f.running().await;
        let before = f.record(id).await;
        f.queue.set_available(false);

        let err = f.reconciler.reconcile(id).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Queue(QueueError::Unavailable(_))));
        assert_eq!(f.record(id).await, before);
    }

    #[tokio::test]
    async fn known_failure_skips_the_queue() {
        let f = fixture(TimeoutPolicy::none());
        let (id, _handle) = f.running().await;
        f.queue.set_available(false);

        let outcome = f
            .reconciler
            .reconcile_with_failure(id, "ValueError: bad input")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::StoppedUnexpectedly
            }
        );
        let record = f.record(id).await;
        assert!(record.technical_detail.unwrap().contains("ValueError: bad input"));
    }

    #[tokio::test]
    async fn second_reconcile_is_a_no_op() {
        let f = fixture(TimeoutPolicy::none());
        let (id, handle) = f.running().await;
        f.queue.set_state(&handle, RemoteState::Failure);

        f.reconciler.reconcile(id).await.unwrap();
        let after_first = f.record(id).await;

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::AlreadyTerminal {
                status: TaskStatus::Failed
            }
        );
        assert_eq!(f.record(id).await, after_first);
    }

    #[tokio::test]
    async fn cancelled_record_is_never_reconciled_to_failed() {
        let f = fixture(TimeoutPolicy::after(Duration::from_secs(1)));
        let (id, handle) = f.running().await;
        f.store
            .finish(id, TerminalUpdate::cancelled(f.clock.now()))
            .await
            .unwrap();
        f.queue.forget(&handle);
        f.clock.advance(chrono::Duration::hours(2));

        let outcome = f.reconciler.reconcile(id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::AlreadyTerminal {
                status: TaskStatus::Cancelled
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reconciles_write_exactly_once() {
        let f = fixture(TimeoutPolicy::none());
        let (id, handle) = f.running().await;
        f.queue.set_state(&handle, RemoteState::Revoked);

        let reconciler = Arc::new(f.reconciler.clone());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let reconciler = reconciler.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    reconciler.reconcile(id).await
                } else {
                    reconciler.reconcile_with_failure(id, "boom").await
                }
            }));
        }

        let mut written = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                ReconcileOutcome::Failed { .. } => written += 1,
                ReconcileOutcome::LostRace { .. } | ReconcileOutcome::AlreadyTerminal { .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(written, 1);
        let record = f.record(id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.log_messages.len(), 1);
    }

    #[tokio::test]
    async fn stale_decision_is_not_written_when_the_record_moved() {
        let f = fixture(TimeoutPolicy::none());
        let (id, handle) = f.dispatched().await;
        f.queue.set_state(&handle, RemoteState::Failure);

        let gate = GatedQueue::arc(f.queue.clone(), GatedCall::RemoteState);
        let reconciler = Arc::new(Reconciler::new(
            f.store.clone(),
            gate.clone(),
            f.clock.clone(),
            TimeoutPolicy::none(),
        ));
        let pending = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.reconcile(id).await }
        });

        // Decided on PENDING; the worker starts before the write.
        gate.entered().await;
        f.store.mark_running(id).await.unwrap();
        gate.open();

        assert_eq!(
            pending.await.unwrap().unwrap(),
            ReconcileOutcome::Failed {
                kind: FailureKind::StoppedUnexpectedly
            }
        );
        let record = f.record(id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("Task stopped unexpectedly.")));
    }
}
