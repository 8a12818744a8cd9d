//! The parameter coordinator.
//!
//! [`ParamCoordinator`] is the only component that mutates row metadata. It
//! hands out claims one at a time, records stage progress, and persists the
//! terminal outcome, delegating atomicity to the [`TableBackend`].
//!
//! Every operation is a single backend call followed by a commit, so no lock
//! is held between a claim and its report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use sweep_core::config::SweepConfig;
use sweep_core::error::{Error, Result};
use sweep_core::overlay::{Claim, ParameterMap};
use sweep_core::row::{FieldChanges, Row, RowId};
use sweep_core::status::Status;

use crate::backend::TableBackend;
use crate::metrics::{record_claim, record_transition};

/// Hands out parameter sets and records their progress.
pub struct ParamCoordinator {
    backend: Arc<dyn TableBackend>,
    defaults: ParameterMap,
    performed_by: Option<String>,
    max_runs: Option<u32>,
    computer_strength: Option<f64>,
    claims_made: AtomicU32,
}

impl std::fmt::Debug for ParamCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamCoordinator")
            .field("backend", &self.backend.kind())
            .field("performed_by", &self.performed_by)
            .field("max_runs", &self.max_runs)
            .field("computer_strength", &self.computer_strength)
            .field("claims_made", &self.claims_made)
            .finish_non_exhaustive()
    }
}

impl ParamCoordinator {
    /// Creates a coordinator with no defaults, identity, or limits.
    #[must_use]
    pub fn new(backend: Arc<dyn TableBackend>) -> Self {
        Self {
            backend,
            defaults: ParameterMap::new(),
            performed_by: None,
            max_runs: None,
            computer_strength: None,
            claims_made: AtomicU32::new(0),
        }
    }

    /// Creates a coordinator configured from `config`.
    #[must_use]
    pub fn from_config(backend: Arc<dyn TableBackend>, config: &SweepConfig) -> Self {
        let mut coordinator = Self::new(backend).with_defaults(config.defaults.clone());
        coordinator.performed_by.clone_from(&config.performed_by);
        coordinator.max_runs = config.max_runs;
        coordinator.computer_strength = config.computer_strength;
        coordinator
    }

    /// Sets the defaults overlaid beneath every claim.
    #[must_use]
    pub fn with_defaults(mut self, defaults: ParameterMap) -> Self {
        self.defaults = defaults;
        self
    }

    /// Sets the identity recorded on claimed rows.
    #[must_use]
    pub fn with_performed_by(mut self, who: impl Into<String>) -> Self {
        self.performed_by = Some(who.into());
        self
    }

    /// Caps the number of rows this coordinator will claim.
    #[must_use]
    pub const fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Sets this worker's strength for `required-computer-strength` checks.
    #[must_use]
    pub const fn with_computer_strength(mut self, strength: f64) -> Self {
        self.computer_strength = Some(strength);
        self
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn TableBackend> {
        &self.backend
    }

    /// Returns how many rows this coordinator has claimed.
    #[must_use]
    pub fn claims_made(&self) -> u32 {
        self.claims_made.load(Ordering::SeqCst)
    }

    fn is_eligible(&self, row: &Row) -> bool {
        if !row.status.is_pending() {
            return false;
        }
        match (row.required_strength, self.computer_strength) {
            (Some(required), Some(available)) => required <= available,
            _ => true,
        }
    }

    /// Reserves one run from the `max_runs` budget.
    fn reserve_run(&self) -> bool {
        match self.max_runs {
            None => {
                self.claims_made.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(max) => self
                .claims_made
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |made| {
                    (made < max).then_some(made + 1)
                })
                .is_ok(),
        }
    }

    fn release_run(&self) {
        self.claims_made.fetch_sub(1, Ordering::SeqCst);
    }

    /// Claims the next eligible row and returns its merged parameters.
    ///
    /// Returns `None` when no pending row is eligible, or once `max_runs`
    /// claims have been made; callers treat it as the signal to stop.
    ///
    /// # Errors
    ///
    /// Returns `BackendIo` or `Contention` when the claim could not be
    /// completed; the worker may retreat and try again.
    #[tracing::instrument(skip(self), fields(backend = self.backend.kind()))]
    pub async fn next_parameters(&self) -> Result<Option<Claim>> {
        if !self.reserve_run() {
            tracing::info!(max_runs = ?self.max_runs, "run limit reached");
            return Ok(None);
        }

        let mut changes = FieldChanges::new()
            .status(Status::Claimed)
            .start_time(Utc::now())
            .clear_comment();
        if let Some(who) = &self.performed_by {
            changes = changes.performed_by(who.clone());
        }

        let started = Instant::now();
        let eligible = |row: &Row| self.is_eligible(row);
        let claimed = self.backend.claim_next(&eligible, &changes).await;
        let elapsed = started.elapsed().as_secs_f64();

        let row = match claimed {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.release_run();
                record_claim(self.backend.kind(), false, elapsed);
                tracing::info!("no eligible rows remain");
                return Ok(None);
            }
            Err(err) => {
                self.release_run();
                return Err(err);
            }
        };
        self.backend.commit().await?;

        record_claim(self.backend.kind(), true, elapsed);
        record_transition(Status::Claimed.class());
        tracing::info!(row_id = %row.id, "claimed row");
        Ok(Some(Claim::from_row(&row, &self.defaults)))
    }

    /// Records an intermediate stage label for a claimed row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the row is terminal or the label is
    /// reserved, and `NotFound` if the id is unknown.
    #[tracing::instrument(skip(self, id), fields(row_id = %id))]
    pub async fn update_status(&self, id: &RowId, label: &str) -> Result<Row> {
        let status = Status::stage(label).map_err(|err| match err {
            Error::InvalidTransition {
                from, to, reason, ..
            } => Error::InvalidTransition {
                id: id.to_string(),
                from,
                to,
                reason,
            },
            other => other,
        })?;
        self.apply(id, FieldChanges::new().status(status)).await
    }

    /// Marks a row successful, stamps `end-time`, and clears the comment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the row already completed.
    #[tracing::instrument(skip(self, id), fields(row_id = %id))]
    pub async fn successful(&self, id: &RowId) -> Result<Row> {
        let changes = FieldChanges::new()
            .status(Status::Success)
            .end_time(Utc::now())
            .clear_comment();
        self.apply(id, changes).await
    }

    /// Marks a row failed, stamps `end-time`, and records `detail`.
    ///
    /// Failed rows are never retried automatically.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the row already completed.
    #[tracing::instrument(skip(self, id, detail), fields(row_id = %id))]
    pub async fn failed(&self, id: &RowId, detail: &str) -> Result<Row> {
        let changes = FieldChanges::new()
            .status(Status::Failed)
            .end_time(Utc::now())
            .comment(detail);
        self.apply(id, changes).await
    }

    async fn apply(&self, id: &RowId, changes: FieldChanges) -> Result<Row> {
        let row = self.backend.update(id, &changes).await?;
        self.backend.commit().await?;
        record_transition(row.status.class());
        tracing::info!(status = %row.status, "status updated");
        Ok(row)
    }

    /// Returns a snapshot of every row.
    ///
    /// # Errors
    ///
    /// Returns `BackendIo` or `Schema` if the table cannot be read.
    pub async fn rows(&self) -> Result<Vec<Row>> {
        self.backend.read_all().await
    }

    /// Counts rows per status class.
    ///
    /// # Errors
    ///
    /// Returns `BackendIo` or `Schema` if the table cannot be read.
    pub async fn summary(&self) -> Result<SweepSummary> {
        Ok(SweepSummary::from_rows(&self.rows().await?))
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// All rows.
    pub total: usize,
    /// Rows not yet claimed.
    pub pending: usize,
    /// Rows claimed or in a stage.
    pub in_progress: usize,
    /// Rows completed successfully.
    pub success: usize,
    /// Rows completed with a failure.
    pub failed: usize,
    /// In-progress rows by exact status label.
    pub stages: BTreeMap<String, usize>,
}

impl SweepSummary {
    /// Tallies a snapshot of rows.
    #[must_use]
    pub fn from_rows(rows: &[Row]) -> Self {
        let mut summary = Self {
            total: rows.len(),
            ..Self::default()
        };
        for row in rows {
            match &row.status {
                Status::Pending => summary.pending += 1,
                Status::Success => summary.success += 1,
                Status::Failed => summary.failed += 1,
                status @ (Status::Claimed | Status::Stage(_)) => {
                    summary.in_progress += 1;
                    *summary.stages.entry(status.as_str().to_string()).or_default() += 1;
                }
            }
        }
        summary
    }

    /// Returns true when no row is pending or in progress.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}
