//! Periodic driver for the retry sweep.
//!
//! Runs sweep passes until cancelled. A batch in which every claimed record
//! advanced (succeeded, rescheduled or exhausted) is followed immediately by
//! another pass; anything else waits one interval. Released records keep
//! their old deadline and are due again at once, so a pass that released
//! any, or whose claim failed outright, always sleeps before the next.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sendparcel_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::Result,
    sweep::{RetrySweep, SweepReport},
};

/// Default pause between passes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default time allowed for an in-flight pass to finish on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheduling for the sweep worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pause between passes that did not fill a batch.
    pub interval: Duration,

    /// Time allowed for the current pass to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_SWEEP_INTERVAL, shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT }
    }
}

/// Running totals across sweep passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    /// Passes that completed.
    pub passes: u64,
    /// Passes that failed to claim.
    pub failed_passes: u64,
    /// Records attempted.
    pub processed: u64,
    /// Replays that succeeded.
    pub succeeded: u64,
    /// Records rescheduled.
    pub rescheduled: u64,
    /// Records dead-lettered.
    pub exhausted: u64,
    /// Records released after storage failures.
    pub released: u64,
    /// Records whose outcome could not be recorded.
    pub errors: u64,
    /// When the last pass finished.
    pub last_pass_at: Option<DateTime<Utc>>,
}

impl SweepStats {
    fn absorb(&mut self, report: &SweepReport, at: DateTime<Utc>) {
        let widen = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);

        self.passes += 1;
        self.processed += widen(report.processed);
        self.succeeded += widen(report.succeeded);
        self.rescheduled += widen(report.rescheduled);
        self.exhausted += widen(report.exhausted);
        self.released += widen(report.released);
        self.errors += widen(report.errors);
        self.last_pass_at = Some(at);
    }
}

/// Background worker running sweep passes on an interval.
pub struct SweepWorker {
    sweep: Arc<RetrySweep>,
    config: WorkerConfig,
    stats: Arc<RwLock<SweepStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl SweepWorker {
    /// Creates a worker around `sweep`.
    pub fn new(sweep: Arc<RetrySweep>, config: WorkerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sweep,
            config,
            stats: Arc::new(RwLock::new(SweepStats::default())),
            cancellation_token: CancellationToken::new(),
            clock,
        }
    }

    /// Token that stops the worker when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Returns a snapshot of the running totals.
    pub async fn stats(&self) -> SweepStats {
        self.stats.read().await.clone()
    }

    /// Runs one pass and folds its report into the stats.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn run_once(&self) -> Result<SweepReport> {
        match self.sweep.process_due_retries().await {
            Ok(report) => {
                self.stats.write().await.absorb(&report, self.clock.now());
                Ok(report)
            },
            Err(err) => {
                self.stats.write().await.failed_passes += 1;
                Err(err)
            },
        }
    }

    /// Runs passes until the cancellation token fires.
    pub async fn run(&self) {
        info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.sweep.config().batch_size,
            "retry sweep worker starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                info!("retry sweep worker received shutdown signal");
                break;
            }

            let full_batch = match self.run_once().await {
                Ok(report) => report.advanced() >= self.sweep.config().batch_size,
                Err(err) => {
                    error!(error = %err, "retry sweep pass failed");
                    false
                },
            };

            if !full_batch {
                tokio::select! {
                    () = self.clock.sleep(self.config.interval) => {}
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!("retry sweep worker stopped");
    }

    /// Moves the worker onto its own task.
    pub fn spawn(self) -> SweepHandle {
        let worker = Arc::new(self);
        let task = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        SweepHandle { worker, task }
    }
}

/// Handle to a spawned [`SweepWorker`].
pub struct SweepHandle {
    worker: Arc<SweepWorker>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Returns a snapshot of the worker's running totals.
    pub async fn stats(&self) -> SweepStats {
        self.worker.stats().await
    }

    /// Cancels the worker and waits for the current pass to finish.
    ///
    /// If the pass outlives the shutdown timeout the task is aborted; the
    /// records it held become claimable again once their lease expires.
    pub async fn shutdown(self) {
        info!("shutting down retry sweep worker");
        self.worker.cancellation_token.cancel();

        let timeout = self.worker.config.shutdown_timeout;
        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => info!("retry sweep worker shut down cleanly"),
            Ok(Err(err)) => error!(error = %err, "retry sweep worker task failed"),
            Err(_) => {
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "retry sweep worker did not stop in time, aborting"
                );
                abort.abort();
            },
        }
    }
}
