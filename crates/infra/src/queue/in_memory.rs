//! In-process broker with finite result retention.
//!
//! Stands in for a real queue in tests and local development. It never runs
//! job bodies; tests (or a local worker) drive remote states by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use taskwatch_core::{Clock, RemoteHandle, RemoteState, SystemClock, TaskId};

use super::{QueueClient, QueueError};

/// Default result retention (one day).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Most recent revoke requests kept for inspection.
pub const REVOCATION_LOG_CAP: usize = 1024;

#[derive(Debug, Clone)]
struct QueuedJob {
    task_id: TaskId,
    task_type: String,
    payload: JsonValue,
    state: RemoteState,
    failure_detail: Option<String>,
    changed_at: DateTime<Utc>,
}

/// In-memory queue.
///
/// A handle whose last state change is older than `retention` is forgotten
/// and reported as [`RemoteState::Unknown`], the same way a result backend
/// expires old entries. Expired jobs are dropped on lookup and on every
/// dispatch, so memory stays bounded by what one retention window admits.
pub struct InMemoryQueue {
    jobs: Mutex<HashMap<RemoteHandle, QueuedJob>>,
    revocations: Mutex<VecDeque<RemoteHandle>>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("retention", &self.retention)
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(SystemClock, DEFAULT_RETENTION)
    }
}

impl InMemoryQueue {
    pub fn new(clock: impl Clock, retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            revocations: Mutex::new(VecDeque::new()),
            available: AtomicBool::new(true),
            clock: Arc::new(clock),
            retention,
        }
    }

    pub fn arc(clock: impl Clock, retention: Duration) -> Arc<Self> {
        Arc::new(Self::new(clock, retention))
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Force a remote state. Returns `false` if the handle is not known.
    pub fn set_state(&self, handle: &RemoteHandle, state: RemoteState) -> bool {
        let now = self.clock.now();
        let mut jobs = self.jobs_lock();
        match jobs.get_mut(handle) {
            Some(job) => {
                job.state = state;
                job.changed_at = now;
                true
            }
            None => false,
        }
    }

    /// Mark the job FAILURE and keep `detail` as its failure text.
    pub fn fail(&self, handle: &RemoteHandle, detail: impl Into<String>) -> bool {
        let now = self.clock.now();
        let mut jobs = self.jobs_lock();
        match jobs.get_mut(handle) {
            Some(job) => {
                job.state = RemoteState::Failure;
                job.failure_detail = Some(detail.into());
                job.changed_at = now;
                true
            }
            None => false,
        }
    }

    /// Drop all memory of a handle, as a crashed worker or expired backend would.
    pub fn forget(&self, handle: &RemoteHandle) -> bool {
        self.jobs_lock().remove(handle).is_some()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`QueueError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Handles for which a revoke was requested, in request order. Only the
    /// last [`REVOCATION_LOG_CAP`] are kept.
    pub fn revocations(&self) -> Vec<RemoteHandle> {
        self.revocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Jobs currently retained.
    pub fn len(&self) -> usize {
        self.jobs_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The handle dispatched for a task, if still retained.
    pub fn handle_for(&self, task_id: TaskId) -> Option<RemoteHandle> {
        self.jobs_lock()
            .iter()
            .find(|(_, job)| job.task_id == task_id)
            .map(|(handle, _)| handle.clone())
    }

    /// Task type and payload the job was dispatched with.
    pub fn job_input(&self, handle: &RemoteHandle) -> Option<(String, JsonValue)> {
        self.jobs_lock()
            .get(handle)
            .map(|job| (job.task_type.clone(), job.payload.clone()))
    }

    fn jobs_lock(&self) -> MutexGuard<'_, HashMap<RemoteHandle, QueuedJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("broker connection refused".to_string()))
        }
    }

    /// Look up a job, pruning it first if it has outlived the retention window.
    fn lookup(&self, handle: &RemoteHandle) -> Option<QueuedJob> {
        let now = self.clock.now();
        let mut jobs = self.jobs_lock();
        let expired = jobs.get(handle).is_some_and(|job| self.is_expired(job, now));
        if expired {
            jobs.remove(handle);
            return None;
        }
        jobs.get(handle).cloned()
    }

    fn is_expired(&self, job: &QueuedJob, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.retention) {
            Ok(retention) => now - job.changed_at > retention,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn dispatch(
        &self,
        task_id: TaskId,
        task_type: &str,
        payload: &JsonValue,
    ) -> Result<RemoteHandle, QueueError> {
        self.ensure_available()?;
        let handle = RemoteHandle::new(uuid::Uuid::now_v7().to_string())
            .map_err(|e| QueueError::Rejected(e.to_string()))?;

        let now = self.clock.now();
        let mut jobs = self.jobs_lock();
        jobs.retain(|_, job| !self.is_expired(job, now));
        jobs.insert(
            handle.clone(),
            QueuedJob {
                task_id,
                task_type: task_type.to_string(),
                payload: payload.clone(),
                state: RemoteState::Pending,
                failure_detail: None,
                changed_at: now,
            },
        );
        Ok(handle)
    }

    async fn remote_state(&self, handle: &RemoteHandle) -> Result<RemoteState, QueueError> {
        self.ensure_available()?;
        Ok(self
            .lookup(handle)
            .map_or(RemoteState::Unknown, |job| job.state))
    }

    async fn failure_detail(&self, handle: &RemoteHandle) -> Result<Option<String>, QueueError> {
        self.ensure_available()?;
        Ok(self.lookup(handle).and_then(|job| job.failure_detail))
    }

    async fn revoke(&self, handle: &RemoteHandle) -> Result<bool, QueueError> {
        self.ensure_available()?;
        {
            let mut log = self
                .revocations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if log.len() >= REVOCATION_LOG_CAP {
                log.pop_front();
            }
            log.push_back(handle.clone());
        }

        let now = self.clock.now();
        let mut jobs = self.jobs_lock();
        match jobs.get_mut(handle) {
            Some(job) if matches!(job.state, RemoteState::Pending | RemoteState::Started) => {
                job.state = RemoteState::Revoked;
                job.changed_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwatch_core::ManualClock;

    fn queue(clock: &ManualClock) -> InMemoryQueue {
        InMemoryQueue::new(clock.clone(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn dispatched_job_starts_pending() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        let task_id = TaskId::new();

        let handle = q
            .dispatch(task_id, "export", &serde_json::json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(q.remote_state(&handle).await.unwrap(), RemoteState::Pending);
        assert_eq!(q.handle_for(task_id), Some(handle.clone()));
        assert_eq!(
            q.job_input(&handle),
            Some(("export".to_string(), serde_json::json!({"n": 1})))
        );
    }

    #[tokio::test]
    async fn never_seen_handle_is_unknown_not_pending() {
        let q = InMemoryQueue::default();
        let handle = RemoteHandle::new("nope").unwrap();
        assert_eq!(q.remote_state(&handle).await.unwrap(), RemoteState::Unknown);
    }

    #[tokio::test]
    async fn retention_expiry_forgets_the_handle() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        let handle = q
            .dispatch(TaskId::new(), "export", &JsonValue::Null)
            .await
            .unwrap();
        q.set_state(&handle, RemoteState::Started);

        clock.advance(chrono::Duration::seconds(3600));
        assert_eq!(q.remote_state(&handle).await.unwrap(), RemoteState::Started);

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(q.remote_state(&handle).await.unwrap(), RemoteState::Unknown);
        assert!(!q.set_state(&handle, RemoteState::Started));
    }

    #[tokio::test]
    async fn dispatch_drops_jobs_past_retention() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        let old = TaskId::new();
        q.dispatch(old, "export", &JsonValue::Null).await.unwrap();

        clock.advance(chrono::Duration::seconds(3601));
        let fresh = TaskId::new();
        q.dispatch(fresh, "export", &JsonValue::Null).await.unwrap();

        assert_eq!(q.len(), 1);
        assert!(q.handle_for(old).is_none());
        assert!(q.handle_for(fresh).is_some());
    }

    #[tokio::test]
    async fn revocation_log_keeps_only_the_latest() {
        let q = InMemoryQueue::default();
        for i in 0..REVOCATION_LOG_CAP + 2 {
            let handle = RemoteHandle::new(format!("h-{i}")).unwrap();
            q.revoke(&handle).await.unwrap();
        }

        let log = q.revocations();
        assert_eq!(log.len(), REVOCATION_LOG_CAP);
        assert_eq!(log[0].as_str(), "h-2");
        assert_eq!(
            log.last().map(|h| h.as_str().to_string()),
            Some(format!("h-{}", REVOCATION_LOG_CAP + 1))
        );
    }

    #[tokio::test]
    async fn failure_detail_is_kept_with_the_failure() {
        let q = InMemoryQueue::default();
        let handle = q
            .dispatch(TaskId::new(), "export", &JsonValue::Null)
            .await
            .unwrap();

        assert_eq!(q.failure_detail(&handle).await.unwrap(), None);
        q.fail(&handle, "ValueError: bad input");
        assert_eq!(q.remote_state(&handle).await.unwrap(), RemoteState::Failure);
        assert_eq!(
            q.failure_detail(&handle).await.unwrap().as_deref(),
            Some("ValueError: bad input")
        );
    }

    #[tokio::test]
    async fn revoke_is_recorded_and_only_acknowledged_for_live_jobs() {
        let q = InMemoryQueue::default();
        let handle = q
            .dispatch(TaskId::new(), "export", &JsonValue::Null)
            .await
            .unwrap();

        assert!(q.revoke(&handle).await.unwrap());
        assert_eq!(q.remote_state(&handle).await.unwrap(), RemoteState::Revoked);
        assert!(!q.revoke(&handle).await.unwrap());
        assert_eq!(q.revocations(), vec![handle.clone(), handle]);
    }

    #[tokio::test]
    async fn outage_is_an_error_not_a_state() {
        let q = InMemoryQueue::default();
        let handle = q
            .dispatch(TaskId::new(), "export", &JsonValue::Null)
            .await
            .unwrap();

        q.set_available(false);
        assert!(matches!(
            q.remote_state(&handle).await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(q.dispatch(TaskId::new(), "x", &JsonValue::Null).await.is_err());

        q.set_available(true);
        assert_eq!(q.remote_state(&handle).await.unwrap(), RemoteState::Pending);
    }
}
