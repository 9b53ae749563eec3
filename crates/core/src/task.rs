//! Task record and its lifecycle graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{RemoteHandle, TaskId};

/// Lifecycle status of a tracked task.
///
/// Allowed edges:
/// `Pending -> Running -> {Completed, Failed}`, `Pending -> {Failed, Cancelled}`,
/// `Running -> Cancelled`. Nothing leaves a terminal status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, not yet picked up by a worker
    Pending,
    /// A worker has started the job body
    Running,
    /// The job body finished and stored its result
    Completed,
    /// Failed (self-reported or detected)
    Failed,
    /// Cancelled on request
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub const NON_TERMINAL: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        Self::sources_of(next).contains(self)
    }

    /// Statuses from which `target` may be entered.
    ///
    /// Persistent stores use this to build their conditional writes.
    pub fn sources_of(target: TaskStatus) -> &'static [TaskStatus] {
        match target {
            TaskStatus::Pending => &[],
            TaskStatus::Running => &[TaskStatus::Pending],
            TaskStatus::Completed => &[TaskStatus::Running],
            TaskStatus::Failed | TaskStatus::Cancelled => &TaskStatus::NON_TERMINAL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown task status: {s}")))
    }
}

/// Everything a terminal write sets, applied as a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalUpdate {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub technical_detail: Option<String>,
    pub result: Option<JsonValue>,
    pub log_message: Option<String>,
}

impl TerminalUpdate {
    pub fn failed(
        at: DateTime<Utc>,
        error_message: impl Into<String>,
        technical_detail: impl Into<String>,
    ) -> Self {
        Self {
            status: TaskStatus::Failed,
            at,
            error_message: Some(error_message.into()),
            technical_detail: Some(technical_detail.into()),
            result: None,
            log_message: None,
        }
    }

    pub fn completed(at: DateTime<Utc>, result: JsonValue) -> Self {
        Self {
            status: TaskStatus::Completed,
            at,
            error_message: None,
            technical_detail: None,
            result: Some(result),
            log_message: None,
        }
    }

    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            at,
            error_message: None,
            technical_detail: None,
            result: None,
            log_message: None,
        }
    }

    pub fn with_log(mut self, message: impl Into<String>) -> Self {
        self.log_message = Some(message.into());
        self
    }

    pub fn with_technical_detail(mut self, detail: impl Into<String>) -> Self {
        self.technical_detail = Some(detail.into());
        self
    }
}

/// The durable, locally-owned representation of one submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    /// Set once at dispatch time
    pub remote_handle: Option<RemoteHandle>,
    pub task_type: String,
    /// Opaque input forwarded to the queue at dispatch
    pub payload: JsonValue,
    pub status: TaskStatus,
    /// Timeout anchor
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the status becomes terminal
    pub completed_at: Option<DateTime<Utc>>,
    pub log_messages: Vec<String>,
    /// User-facing failure summary (FAILED only)
    pub error_message: Option<String>,
    /// Internal diagnostics; never rendered to end users
    pub technical_detail: Option<String>,
    /// Job output (COMPLETED only)
    pub result: Option<JsonValue>,
}

impl TaskRecord {
    /// Create a new PENDING record.
    pub fn new(
        task_type: impl Into<String>,
        payload: JsonValue,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(DomainError::validation("task_type must not be empty"));
        }

        Ok(Self {
            task_id: TaskId::new(),
            remote_handle: None,
            task_type,
            payload,
            status: TaskStatus::Pending,
            created_at,
            completed_at: None,
            log_messages: Vec::new(),
            error_message: None,
            technical_detail: None,
            result: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record the handle returned by the queue. Allowed once.
    pub fn assign_remote_handle(&mut self, handle: RemoteHandle) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "task {} is {} and can no longer change",
                self.task_id, self.status
            )));
        }
        if self.remote_handle.is_some() {
            return Err(DomainError::invariant(format!(
                "task {} already has a remote handle",
                self.task_id
            )));
        }
        self.remote_handle = Some(handle);
        Ok(())
    }

    /// Mark the job body as started.
    pub fn start(&mut self) -> DomainResult<()> {
        self.check_transition(TaskStatus::Running)?;
        if self.remote_handle.is_none() {
            return Err(DomainError::invariant(format!(
                "task {} cannot run before it has a remote handle",
                self.task_id
            )));
        }
        self.status = TaskStatus::Running;
        Ok(())
    }

    pub fn append_log(&mut self, message: impl Into<String>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "task {} is {}; its log is closed",
                self.task_id, self.status
            )));
        }
        self.log_messages.push(message.into());
        Ok(())
    }

    /// Apply a terminal write.
    ///
    /// Fields that do not belong to the target status are dropped, so a
    /// record can only ever carry an `error_message` when FAILED and a
    /// `result` when COMPLETED.
    pub fn finish(&mut self, update: TerminalUpdate) -> DomainResult<()> {
        if !update.status.is_terminal() {
            return Err(DomainError::validation(format!(
                "{} is not a terminal status",
                update.status
            )));
        }
        self.check_transition(update.status)?;

        self.status = update.status;
        self.completed_at = Some(update.at);
        if update.status == TaskStatus::Failed {
            self.error_message = update.error_message;
        }
        if update.status == TaskStatus::Completed {
            self.result = update.result;
        }
        if update.technical_detail.is_some() {
            self.technical_detail = update.technical_detail;
        }
        if let Some(message) = update.log_message {
            self.log_messages.push(message);
        }
        Ok(())
    }

    /// `completed_at` is set iff the status is terminal.
    pub fn is_consistent(&self) -> bool {
        self.completed_at.is_some() == self.is_terminal()
            && (self.status == TaskStatus::Pending || self.remote_handle.is_some() || self.is_terminal())
    }

    fn check_transition(&self, next: TaskStatus) -> DomainResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            })
        }
    }
}
