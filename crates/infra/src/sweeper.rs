//! Periodic sweeper.
//!
//! Catches failures nobody is polling for: every `interval` it lists the
//! non-terminal records and reconciles each one. Runs once immediately on
//! startup. Errors never escape a sweep; they are logged and counted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use taskwatch_core::{Clock, TaskId};

use crate::queue::QueueClient;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::store::{TaskStore, TaskStoreError};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sleep between the end of one sweep and the start of the next
    pub interval: Duration,
    /// Reconciliations allowed in flight at once; 1 = sequential
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_concurrent: 1,
            name: "task-sweeper".to_string(),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Result of one pass over the non-terminal records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub failed: usize,
    pub left: usize,
    pub already_terminal: usize,
    pub lost_race: usize,
    pub not_found: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::NotFound => self.not_found += 1,
            ReconcileOutcome::AlreadyTerminal { .. } => self.already_terminal += 1,
            ReconcileOutcome::Left { .. } => self.left += 1,
            ReconcileOutcome::Failed { .. } => self.failed += 1,
            ReconcileOutcome::LostRace { .. } => self.lost_race += 1,
        }
    }
}

/// Cumulative statistics of a running sweeper.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub tasks_examined: u64,
    pub tasks_failed: u64,
    pub reconcile_errors: u64,
    /// Sweeps that could not even list the non-terminal records
    pub list_errors: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

/// Handle to a spawned sweeper.
///
/// Dropping the handle without calling [`SweeperHandle::shutdown`] also stops
/// the loop, after its current sweep.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Stop starting new reconciliations. Returns immediately; in-flight
    /// ones keep running.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Request shutdown and wait for in-flight reconciliations to finish.
    pub async fn shutdown(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "task sweeper terminated abnormally");
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Background sweeper over a shared [`Reconciler`].
pub struct Sweeper<S, Q, C> {
    reconciler: Arc<Reconciler<S, Q, C>>,
    config: SweeperConfig,
}

impl<S, Q, C> Sweeper<S, Q, C>
where
    S: TaskStore + 'static,
    Q: QueueClient + 'static,
    C: Clock,
{
    pub fn new(reconciler: Arc<Reconciler<S, Q, C>>, config: SweeperConfig) -> Self {
        Self { reconciler, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run a single sweep to completion.
    ///
    /// Only a failure to list the records is returned as an error; every
    /// per-record failure is counted in the report.
    pub async fn sweep_once(&self) -> Result<SweepReport, TaskStoreError> {
        self.sweep(None).await
    }

    /// Spawn the sweep loop on the current tokio runtime.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let join = tokio::spawn(sweeper_loop(self, shutdown_rx, stats.clone()));

        SweeperHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn sweep(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport, TaskStoreError> {
        let stopping = || shutdown.is_some_and(|rx| *rx.borrow());
        let records = self.reconciler.store().list_non_terminal().await?;

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut in_flight: JoinSet<(TaskId, Result<ReconcileOutcome, ReconcileError>)> =
            JoinSet::new();
        let mut report = SweepReport::default();

        for record in records {
            if stopping() {
                debug!(sweeper = %self.config.name, "shutdown requested; not starting more reconciliations");
                break;
            }
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            if stopping() {
                break;
            }

            let reconciler = self.reconciler.clone();
            let task_id = record.task_id;
            in_flight.spawn(async move {
                let result = reconciler.reconcile(task_id).await;
                drop(permit);
                (task_id, result)
            });
            report.examined += 1;
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(&outcome),
                Ok((task_id, Err(e))) => {
                    warn!(
                        sweeper = %self.config.name,
                        task_id = %task_id,
                        error = %e,
                        "reconciliation failed; will retry next sweep"
                    );
                    report.errors += 1;
                }
                Err(e) => {
                    error!(sweeper = %self.config.name, error = %e, "reconciliation task panicked");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

async fn sweeper_loop<S, Q, C>(
    sweeper: Sweeper<S, Q, C>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<SweeperStats>>,
) where
    S: TaskStore + 'static,
    Q: QueueClient + 'static,
    C: Clock,
{
    let name = sweeper.config.name.clone();
    info!(
        sweeper = %name,
        interval_secs = sweeper.config.interval.as_secs(),
        max_concurrent = sweeper.config.max_concurrent,
        "task sweeper started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let result = sweeper.sweep(Some(&shutdown_rx)).await;
        let now = sweeper.reconciler.clock().now();
        {
            let mut s = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            s.sweeps += 1;
            s.last_sweep_at = Some(now);
            match &result {
                Ok(report) => {
                    s.tasks_examined += report.examined as u64;
                    s.tasks_failed += report.failed as u64;
                    s.reconcile_errors += report.errors as u64;
                }
                Err(_) => s.list_errors += 1,
            }
        }

        match result {
            Ok(report) if report.failed > 0 || report.errors > 0 => {
                info!(
                    sweeper = %name,
                    examined = report.examined,
                    failed = report.failed,
                    errors = report.errors,
                    "sweep finished"
                );
            }
            Ok(report) => {
                debug!(sweeper = %name, examined = report.examined, "sweep finished");
            }
            Err(e) => {
                warn!(sweeper = %name, error = %e, "sweep could not list tasks");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(sweeper.config.interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(sweeper = %name, "task sweeper stopped");
}
