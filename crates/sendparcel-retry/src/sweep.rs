//! One pass over the retry queue.
//!
//! A pass claims due records, replays each through the dispatcher and
//! records the outcome. A failing record never aborts the pass: its
//! outcome is logged and the next record is processed.

use std::{sync::Arc, time::Duration};

use sendparcel_core::{ClaimToken, RetryId, RetryView};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::CallbackDispatcher,
    error::{CallbackError, Result},
    provider::InboundCallback,
    storage::RetryStore,
};

/// Default number of records claimed per pass.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default claim lease.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Tuning for a sweep pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Records claimed per pass.
    pub batch_size: usize,

    /// How long a claim is held before another pass may take the record.
    pub claim_timeout: Duration,

    /// Whether replays re-run provider verification.
    pub verify_on_replay: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            verify_on_replay: true,
        }
    }
}

/// What happened to a single record during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Replay succeeded; record is terminal.
    Succeeded,
    /// Replay failed transiently; record is pending with a later deadline.
    Rescheduled,
    /// Record was dead-lettered.
    Exhausted,
    /// Storage failed mid-replay; claim dropped without counting an attempt.
    Released,
    /// The record reached a terminal state elsewhere, or its claim lapsed and
    /// another pass now holds it.
    Skipped,
}

/// Counts for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Records attempted, whatever the outcome.
    pub processed: usize,
    /// Records whose replay succeeded.
    pub succeeded: usize,
    /// Records rescheduled after a transient failure.
    pub rescheduled: usize,
    /// Records dead-lettered.
    pub exhausted: usize,
    /// Records released after a storage failure.
    pub released: usize,
    /// Records whose outcome could not be recorded.
    pub errors: usize,
}

impl SweepReport {
    /// Records whose state moved forward: succeeded, rescheduled or
    /// exhausted. Released and failed records are due again immediately, so
    /// they do not count.
    pub fn advanced(&self) -> usize {
        self.succeeded + self.rescheduled + self.exhausted
    }

    fn record(&mut self, outcome: &Result<RecordOutcome>) {
        self.processed += 1;
        match outcome {
            Ok(RecordOutcome::Succeeded) => self.succeeded += 1,
            Ok(RecordOutcome::Rescheduled) => self.rescheduled += 1,
            Ok(RecordOutcome::Exhausted) => self.exhausted += 1,
            Ok(RecordOutcome::Released) => self.released += 1,
            Ok(RecordOutcome::Skipped) => {},
            Err(_) => self.errors += 1,
        }
    }
}

/// Replays due records from the retry queue.
pub struct RetrySweep {
    dispatcher: Arc<CallbackDispatcher>,
    store: Arc<dyn RetryStore>,
    config: SweepConfig,
}

impl RetrySweep {
    /// Creates a sweep over `store` replaying through `dispatcher`.
    pub fn new(
        dispatcher: Arc<CallbackDispatcher>,
        store: Arc<dyn RetryStore>,
        config: SweepConfig,
    ) -> Self {
        Self { dispatcher, store, config }
    }

    /// Sweep configuration.
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Claims up to `batch_size` due records and replays each.
    ///
    /// # Errors
    ///
    /// Returns `Storage` only if the claim itself fails. Failures on
    /// individual records are counted in the report instead.
    pub async fn process_due_retries(&self) -> Result<SweepReport> {
        self.process_batch(self.config.batch_size).await
    }

    /// Claims up to `limit` due records and replays each.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the claim fails.
    pub async fn process_batch(&self, limit: usize) -> Result<SweepReport> {
        let records = self.store.claim_due_retries(limit, self.config.claim_timeout).await?;
        let mut report = SweepReport::default();

        if records.is_empty() {
            debug!("no callback retries due");
            return Ok(report);
        }

        debug!(count = records.len(), "claimed callback retries");

        for view in records {
            let retry_id = view.id;
            let outcome = self.process_record(view).await;
            if let Err(err) = &outcome {
                error!(retry_id = %retry_id, error = %err, "failed to record retry outcome");
            }
            report.record(&outcome);
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            rescheduled = report.rescheduled,
            exhausted = report.exhausted,
            released = report.released,
            errors = report.errors,
            "retry sweep completed"
        );

        Ok(report)
    }

    async fn process_record(&self, view: RetryView) -> Result<RecordOutcome> {
        let retry_id = view.id;
        let attempts = view.attempts;
        let claim = view.claim;
        let callback = InboundCallback::from(view);

        match self.dispatcher.replay(&callback, self.config.verify_on_replay).await {
            Ok(shipment) => {
                let changed = self.store.mark_succeeded(retry_id, claim).await?;
                info!(
                    retry_id = %retry_id,
                    shipment_id = %shipment.id,
                    status = %shipment.status,
                    "callback retry succeeded"
                );
                Ok(if changed { RecordOutcome::Succeeded } else { RecordOutcome::Skipped })
            },
            Err(err @ CallbackError::Storage { .. }) => {
                warn!(retry_id = %retry_id, error = %err, "storage failed during replay, releasing");
                let released = self.store.release_claim(retry_id, claim).await?;
                Ok(if released { RecordOutcome::Released } else { RecordOutcome::Skipped })
            },
            Err(err) if err.is_permanent() => self.exhaust(retry_id, claim, &err).await,
            Err(err) => {
                if self.dispatcher.policy().is_exhausted_after(attempts) {
                    self.exhaust(retry_id, claim, &err).await
                } else {
                    let changed =
                        self.store.mark_failed(retry_id, claim, err.to_string()).await?;
                    warn!(
                        retry_id = %retry_id,
                        attempts = attempts.saturating_add(1),
                        error = %err,
                        "callback retry failed, rescheduled"
                    );
                    Ok(if changed { RecordOutcome::Rescheduled } else { RecordOutcome::Skipped })
                }
            },
        }
    }

    async fn exhaust(
        &self,
        retry_id: RetryId,
        claim: Option<ClaimToken>,
        err: &CallbackError,
    ) -> Result<RecordOutcome> {
        let changed = self.store.mark_exhausted(retry_id, claim, err.to_string()).await?;
        warn!(retry_id = %retry_id, error = %err, "callback retry exhausted");
        Ok(if changed { RecordOutcome::Exhausted } else { RecordOutcome::Skipped })
    }
}
