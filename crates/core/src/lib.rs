//! `taskwatch-core`: task lifecycle building blocks.
//!
//! This crate contains **pure** primitives (no IO): identifiers, the task
//! record and its lifecycle graph, the timeout policy and the reconciliation
//! decision table.

pub mod clock;
pub mod error;
pub mod id;
pub mod reconcile;
pub mod remote;
pub mod task;
pub mod timeout;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{RemoteHandle, TaskId};
pub use reconcile::{Decision, FailureKind, FailureReport, LeaveReason};
pub use remote::RemoteState;
pub use task::{TaskRecord, TaskStatus, TerminalUpdate};
pub use timeout::TimeoutPolicy;
