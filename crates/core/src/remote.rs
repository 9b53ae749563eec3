//! What the remote queue can tell us about a dispatched job.

use serde::{Deserialize, Serialize};

/// Coarse remote state of a dispatched job.
///
/// Any real queue integration maps its native states onto these values and
/// must keep `Pending` ("known, not started") apart from `Unknown` ("no
/// memory of this handle at all").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteState {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
    Rejected,
    /// The queue has no record of the handle: never registered, pruned after
    /// the retention window, or lost when its worker died.
    Unknown,
}

impl RemoteState {
    pub const ALL: [RemoteState; 7] = [
        RemoteState::Pending,
        RemoteState::Started,
        RemoteState::Success,
        RemoteState::Failure,
        RemoteState::Revoked,
        RemoteState::Rejected,
        RemoteState::Unknown,
    ];

    /// The queue itself says the job will not finish.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            RemoteState::Failure | RemoteState::Revoked | RemoteState::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteState::Pending => "PENDING",
            RemoteState::Started => "STARTED",
            RemoteState::Success => "SUCCESS",
            RemoteState::Failure => "FAILURE",
            RemoteState::Revoked => "REVOKED",
            RemoteState::Rejected => "REJECTED",
            RemoteState::Unknown => "UNKNOWN",
        }
    }
}

impl core::fmt::Display for RemoteState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
