//! The worker loop.
//!
//! Claim a row, record each stage label, run the stage, and report the
//! outcome; repeat until the coordinator signals there is nothing left.
//! A failed stage marks the row failed and the loop moves on. Backend
//! errors worth retrying, whether from a claim or from recording a claimed
//! row's progress, make the worker retreat for a pause, up to a bounded
//! number of consecutive failures. A row whose progress could not be
//! recorded is abandoned in its last persisted status.

use std::path::PathBuf;

use serde::Serialize;
use sweep_core::config::{PipelineConfig, WorkerConfig};
use sweep_core::error::{Error, Result};
use sweep_core::observability::row_span;
use sweep_core::{Claim, RowId};
use sweep_dispatch::ParamCoordinator;
use tracing::Instrument;

use crate::pipeline::{StageContext, run_stage, substitute, write_params_file};

/// Counts of rows processed by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    /// Rows that completed every stage.
    pub succeeded: u32,
    /// Rows marked failed.
    pub failed: u32,
    /// Claim attempts that were retried after a retreat.
    pub retreats: u32,
    /// Claimed rows dropped because their progress could not be recorded.
    pub abandoned: u32,
}

/// Drives claimed rows through a pipeline.
#[derive(Debug)]
pub struct Worker {
    coordinator: ParamCoordinator,
    pipeline: PipelineConfig,
    settings: WorkerConfig,
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        coordinator: ParamCoordinator,
        pipeline: PipelineConfig,
        settings: WorkerConfig,
    ) -> Self {
        Self {
            coordinator,
            pipeline,
            settings,
        }
    }

    /// Returns the coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &ParamCoordinator {
        &self.coordinator
    }

    /// Runs until no eligible rows remain.
    ///
    /// # Errors
    ///
    /// Returns the last claim error once `max_consecutive_errors` retreats
    /// happen in a row, or any error recording a row's progress.
    pub async fn run(&self) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        let mut consecutive_errors = 0;

        loop {
            let claim = match self.coordinator.next_parameters().await {
                Ok(Some(claim)) => claim,
                Ok(None) => break,
                Err(err) if err.is_retreatable() => {
                    self.retreat(err, &mut consecutive_errors).await?;
                    report.retreats += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let span = row_span("process", claim.id.as_str());
            match self.process(&claim).instrument(span).await {
                Ok(None) => report.succeeded += 1,
                Ok(Some(_)) => report.failed += 1,
                Err(err) if err.is_retreatable() => {
                    tracing::warn!(row_id = %claim.id, error = %err, "abandoning row");
                    report.abandoned += 1;
                    self.retreat(err, &mut consecutive_errors).await?;
                    continue;
                }
                Err(err) => return Err(err),
            }
            consecutive_errors = 0;
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "no rows remain, worker finished"
        );
        Ok(report)
    }

    /// Pauses after a backend error, or returns it once too many happened
    /// in a row.
    async fn retreat(&self, err: Error, consecutive_errors: &mut u32) -> Result<()> {
        *consecutive_errors += 1;
        if *consecutive_errors >= self.settings.max_consecutive_errors {
            tracing::error!(error = %err, consecutive_errors = *consecutive_errors, "giving up");
            return Err(err);
        }
        tracing::warn!(
            error = %err,
            consecutive_errors = *consecutive_errors,
            retreat_ms = self.settings.retreat_ms,
            "backend error, retreating"
        );
        tokio::time::sleep(self.settings.retreat()).await;
        Ok(())
    }

    /// Runs every stage for one claim and records the outcome.
    ///
    /// Returns the failure detail if the row was marked failed.
    async fn process(&self, claim: &Claim) -> Result<Option<String>> {
        let params_file = self
            .settings
            .params_file
            .as_ref()
            .map(|path| PathBuf::from(substitute(&path.to_string_lossy(), claim.id.as_str())));

        if let Some(path) = &params_file {
            if let Err(e) = write_params_file(path, claim) {
                return self.fail(&claim.id, format!("{e:#}")).await;
            }
        }

        let ctx = StageContext {
            claim,
            params_file: params_file.as_deref(),
        };
        for stage in &self.pipeline.stages {
            self.coordinator
                .update_status(&claim.id, stage.label())
                .await?;
            let outcome = run_stage(stage, ctx).await;
            tracing::info!(
                stage = stage.label(),
                success = outcome.success,
                exit_code = ?outcome.exit_code,
                duration_ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
                "stage finished"
            );
            if !outcome.success {
                let detail = format!(
                    "stage '{}' failed: {}",
                    stage.label(),
                    outcome.detail.unwrap_or_default()
                );
                return self.fail(&claim.id, detail).await;
            }
        }

        self.coordinator.successful(&claim.id).await?;
        Ok(None)
    }

    async fn fail(&self, id: &RowId, detail: String) -> Result<Option<String>> {
        tracing::warn!(detail = %detail, "row failed");
        self.coordinator.failed(id, &detail).await?;
        Ok(Some(detail))
    }
}
