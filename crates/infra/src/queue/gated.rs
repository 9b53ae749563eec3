//! Queue wrapper that parks chosen calls until the test opens the gate.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{Notify, Semaphore};

use taskwatch_core::{RemoteHandle, RemoteState, TaskId};

use super::{InMemoryQueue, QueueClient, QueueError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum GatedCall {
    Dispatch,
    RemoteState,
}

#[derive(Debug)]
pub(crate) struct GatedQueue {
    inner: Arc<InMemoryQueue>,
    gated: GatedCall,
    entered: Notify,
    release: Semaphore,
}

impl GatedQueue {
    pub(crate) fn arc(inner: Arc<InMemoryQueue>, gated: GatedCall) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gated,
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    /// Wait until a gated call is parked.
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let every parked and future call through.
    pub(crate) fn open(&self) {
        self.release.close();
    }

    async fn pass(&self, call: GatedCall) {
        if call != self.gated {
            return;
        }
        self.entered.notify_one();
        // Closed semaphore == open gate.
        let _ = self.release.acquire().await;
    }
}

#[async_trait]
impl QueueClient for GatedQueue {
    async fn dispatch(
        &self,
        task_id: TaskId,
        task_type: &str,
        payload: &JsonValue,
    ) -> Result<RemoteHandle, QueueError> {
        self.pass(GatedCall::Dispatch).await;
        self.inner.dispatch(task_id, task_type, payload).await
    }

    async fn remote_state(&self, handle: &RemoteHandle) -> Result<RemoteState, QueueError> {
        self.pass(GatedCall::RemoteState).await;
        self.inner.remote_state(handle).await
    }

    async fn failure_detail(&self, handle: &RemoteHandle) -> Result<Option<String>, QueueError> {
        self.inner.failure_detail(handle).await
    }

    async fn revoke(&self, handle: &RemoteHandle) -> Result<bool, QueueError> {
        self.inner.revoke(handle).await
    }
}
