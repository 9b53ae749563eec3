//! Reconciliation decision table.
//!
//! Pure functions only: given what the local record says and what the remote
//! queue says, decide whether the record must be failed. The effectful side
//! (reading the store, asking the queue, writing the result) lives in
//! `taskwatch-infra`.
//!
//! | local \ remote | PENDING / STARTED | SUCCESS | FAILURE / REVOKED / REJECTED | UNKNOWN |
//! |---|---|---|---|---|
//! | PENDING | leave | leave | fail: failed to start | leave |
//! | RUNNING | leave | leave | fail: stopped unexpectedly | fail: vanished |
//! | terminal | leave | leave | leave | leave |
//!
//! `SUCCESS` never acts: only the job body has the result payload, so only
//! the job body records completion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::RemoteState;
use crate::task::{TaskStatus, TerminalUpdate};

const SUPPORT_HINT: &str = "Please try again, or contact support if the problem persists.";

/// Why a task is being failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Never got going (local PENDING)
    FailedToStart,
    /// Died while running, and the queue says so
    StoppedUnexpectedly,
    /// Was running, and the queue no longer has any record of it
    Vanished,
    /// Older than the configured time limit
    TimedOut,
}

impl FailureKind {
    /// Short, non-technical summary shown to end users.
    pub fn user_message(&self) -> String {
        let headline = match self {
            FailureKind::FailedToStart => "Task failed to start.",
            FailureKind::StoppedUnexpectedly | FailureKind::Vanished => "Task stopped unexpectedly.",
            FailureKind::TimedOut => "Task exceeded its time limit.",
        };
        format!("{headline} {SUPPORT_HINT}")
    }

    fn log_line(&self) -> &'static str {
        match self {
            FailureKind::FailedToStart => "Task failed to start",
            FailureKind::StoppedUnexpectedly => "Task stopped unexpectedly",
            FailureKind::Vanished => "Task stopped unexpectedly (no remote record found)",
            FailureKind::TimedOut => "Task exceeded its time limit",
        }
    }
}

/// Why the reconciler left a record alone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Terminal,
    /// Remote side may simply not have progressed yet
    AwaitingProgress,
    /// Remote side reports SUCCESS; the job body records completion itself
    CompletionPending,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    Leave(LeaveReason),
    Fail(FailureKind),
}

impl Decision {
    pub fn is_fail(&self) -> bool {
        matches!(self, Decision::Fail(_))
    }
}

/// Decide from local status and remote state alone.
pub fn decide(local: TaskStatus, remote: RemoteState) -> Decision {
    if local.is_terminal() {
        return Decision::Leave(LeaveReason::Terminal);
    }
    if remote == RemoteState::Success {
        return Decision::Leave(LeaveReason::CompletionPending);
    }

    match (local, remote) {
        (TaskStatus::Pending, r) if r.is_dead() => Decision::Fail(FailureKind::FailedToStart),
        (TaskStatus::Running, r) if r.is_dead() => Decision::Fail(FailureKind::StoppedUnexpectedly),
        (TaskStatus::Running, RemoteState::Unknown) => Decision::Fail(FailureKind::Vanished),
        _ => Decision::Leave(LeaveReason::AwaitingProgress),
    }
}

/// Decide when the worker has already reported the failure.
pub fn decide_known_failure(local: TaskStatus) -> Decision {
    match local {
        TaskStatus::Pending => Decision::Fail(FailureKind::FailedToStart),
        TaskStatus::Running => Decision::Fail(FailureKind::StoppedUnexpectedly),
        _ => Decision::Leave(LeaveReason::Terminal),
    }
}

/// A failure ready to be written: the user-facing kind plus internal detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub technical_detail: String,
}

impl FailureReport {
    pub fn timed_out(limit: Duration, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let age = (now - created_at).num_seconds().max(0);
        Self {
            kind: FailureKind::TimedOut,
            technical_detail: format!(
                "task exceeded its configured time limit of {}s (age {}s)",
                limit.as_secs(),
                age
            ),
        }
    }

    pub fn from_remote(kind: FailureKind, remote: RemoteState, failure_detail: Option<&str>) -> Self {
        let mut technical_detail = format!("remote state {remote}");
        if remote == RemoteState::Unknown {
            technical_detail.push_str(": no record found at the remote system");
        }
        if let Some(detail) = failure_detail.filter(|d| !d.trim().is_empty()) {
            technical_detail.push_str("; ");
            technical_detail.push_str(detail);
        }
        Self {
            kind,
            technical_detail,
        }
    }

    pub fn reported_by_worker(kind: FailureKind, failure_detail: &str) -> Self {
        Self {
            kind,
            technical_detail: format!("failure reported by worker: {failure_detail}"),
        }
    }

    /// Build the terminal write for this failure.
    pub fn into_update(self, at: DateTime<Utc>) -> TerminalUpdate {
        TerminalUpdate::failed(at, self.kind.user_message(), self.technical_detail)
            .with_log(self.kind.log_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pending_with_dead_remote_failed_to_start() {
        for remote in [RemoteState::Failure, RemoteState::Revoked, RemoteState::Rejected] {
            assert_eq!(
                decide(TaskStatus::Pending, remote),
                Decision::Fail(FailureKind::FailedToStart)
            );
        }
    }

    #[test]
    fn pending_with_unknown_is_left_alone() {
        assert_eq!(
            decide(TaskStatus::Pending, RemoteState::Unknown),
            Decision::Leave(LeaveReason::AwaitingProgress)
        );
    }

    #[test]
    fn running_with_unknown_vanished() {
        assert_eq!(
            decide(TaskStatus::Running, RemoteState::Unknown),
            Decision::Fail(FailureKind::Vanished)
        );
    }

    #[test]
    fn running_alive_is_left_alone() {
        for remote in [RemoteState::Pending, RemoteState::Started] {
            assert!(!decide(TaskStatus::Running, remote).is_fail());
        }
    }

    #[test]
    fn vanished_detail_mentions_missing_remote_record() {
        let report = FailureReport::from_remote(FailureKind::Vanished, RemoteState::Unknown, None);
        assert!(report.technical_detail.contains("no record found at the remote system"));

        let update = report.into_update(Utc::now());
        assert_eq!(update.status, TaskStatus::Failed);
        assert!(update.error_message.unwrap().starts_with("Task stopped unexpectedly."));
        assert!(!update.technical_detail.unwrap().is_empty());
    }

    #[test]
    fn remote_failure_detail_is_appended() {
        let report = FailureReport::from_remote(
            FailureKind::StoppedUnexpectedly,
            RemoteState::Failure,
            Some("MemoryError: out of memory"),
        );
        assert_eq!(
            report.technical_detail,
            "remote state FAILURE; MemoryError: out of memory"
        );
    }

    #[test]
    fn timeout_detail_names_the_limit() {
        let created = Utc::now();
        let report = FailureReport::timed_out(
            Duration::from_secs(3600),
            created,
            created + chrono::Duration::minutes(61),
        );
        assert_eq!(report.kind, FailureKind::TimedOut);
        assert!(report.technical_detail.contains("3600s"));
        assert!(report.technical_detail.contains("age 3660s"));
    }

    #[test]
    fn user_messages_carry_support_hint_and_no_internals() {
        for kind in [
            FailureKind::FailedToStart,
            FailureKind::StoppedUnexpectedly,
            FailureKind::Vanished,
            FailureKind::TimedOut,
        ] {
            let msg = kind.user_message();
            assert!(msg.ends_with(SUPPORT_HINT));
            assert!(!msg.contains("remote"));
        }
    }

    fn any_status() -> impl Strategy<Value = TaskStatus> {
        prop::sample::select(TaskStatus::ALL.to_vec())
    }

    fn any_remote() -> impl Strategy<Value = RemoteState> {
        prop::sample::select(RemoteState::ALL.to_vec())
    }

    proptest! {
        /// Property: whatever the inputs, the only write the table can ask for
        /// is a FAILED one, and it never acts on terminal records or SUCCESS.
        #[test]
        fn never_completes_and_never_touches_terminal(local in any_status(), remote in any_remote()) {
            let decision = decide(local, remote);
            if local.is_terminal() || remote == RemoteState::Success {
                prop_assert!(!decision.is_fail());
            }
            if let Decision::Fail(kind) = decision {
                let update = FailureReport::from_remote(kind, remote, None).into_update(Utc::now());
                prop_assert_eq!(update.status, TaskStatus::Failed);
                prop_assert!(local.can_transition_to(update.status));
            }
        }

        /// Property: UNKNOWN is only evidence of death for a RUNNING record.
        #[test]
        fn unknown_only_fails_running(local in any_status()) {
            let failed = decide(local, RemoteState::Unknown).is_fail();
            prop_assert_eq!(failed, local == TaskStatus::Running);
        }
    }
}
