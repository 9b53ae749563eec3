//! Infrastructure layer: task storage, the queue boundary and the three
//! reconciliation triggers (status poll, periodic sweep, failure callback).

pub mod callback;
pub mod config;
pub mod queue;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use callback::{CallbackError, FailureCallback, JobFailure};
pub use config::{ConfigError, TaskwatchConfig};
pub use queue::{InMemoryQueue, QueueClient, QueueError};
pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
pub use service::{CancelOutcome, ServiceError, TaskService};
pub use store::{
    InMemoryTaskStore, PostgresTaskStore, TaskStats, TaskStore, TaskStoreError, TransitionOutcome,
};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig, SweeperHandle, SweeperStats};
pub use worker::TaskReporter;
