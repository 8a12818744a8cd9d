//! Table backends.
//!
//! A [`TableBackend`] is the capability set the coordinator needs over a
//! tabular store: snapshot reads, an atomic claim of the first eligible row,
//! field updates by id, and a visibility flush. Two implementations exist:
//!
//! - [`DelimitedFileBackend`]: a delimited text file guarded by an advisory
//!   lock on a sibling file.
//! - [`SheetsBackend`]: a remote spreadsheet with no native locking, claimed
//!   through optimistic write-then-verify.
//!
//! Callers never branch on which backend is in use; [`open`] picks one from
//! configuration and returns it behind the trait.

pub mod delimited;
pub mod layout;
pub mod sheets;

use std::sync::Arc;

use async_trait::async_trait;
use sweep_core::config::{BackendConfig, SweepConfig};
use sweep_core::error::Result;
use sweep_core::row::{FieldChanges, Row, RowId};

pub use delimited::DelimitedFileBackend;
pub use layout::TableLayout;
pub use sheets::{HttpSheetTransport, MemorySheet, SheetTransport, SheetsBackend};

/// Predicate deciding whether a row may be claimed.
pub type Eligibility<'a> = dyn Fn(&Row) -> bool + Send + Sync + 'a;

/// Storage abstraction over the parameter table.
///
/// # Contract
///
/// - `claim_next` is atomic across processes: two concurrent callers never
///   receive the same row.
/// - `update` validates the status part of `changes` against the freshest
///   copy of the row inside the backend's critical section.
/// - Rows keep their on-storage order; `read_all` and `claim_next` both use it.
#[async_trait]
pub trait TableBackend: Send + Sync + 'static {
    /// Returns a snapshot of every row in table order.
    ///
    /// # Errors
    ///
    /// Returns `BackendIo` if the table cannot be read, or `Schema` if it is
    /// malformed.
    async fn read_all(&self) -> Result<Vec<Row>>;

    /// Claims the first row satisfying `eligible` by applying `changes`.
    ///
    /// Returns the updated row, or `None` when no row is eligible.
    ///
    /// # Errors
    ///
    /// Returns `BackendIo` on storage failure, `Contention` if an optimistic
    /// backend kept losing races, or `Schema` for a malformed table.
    async fn claim_next(
        &self,
        eligible: &Eligibility<'_>,
        changes: &FieldChanges,
    ) -> Result<Option<Row>>;

    /// Applies `changes` to the row with the given id and returns it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the id is absent, `InvalidTransition` if the
    /// status change is not allowed, or `BackendIo` on storage failure.
    async fn update(&self, id: &RowId, changes: &FieldChanges) -> Result<Row>;

    /// Makes all prior changes visible to other processes.
    ///
    /// # Errors
    ///
    /// Returns `BackendIo` if buffered changes cannot be flushed.
    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    /// Short backend name for logs and metrics.
    fn kind(&self) -> &'static str;
}

/// Opens the backend selected by `config.backend`.
///
/// # Errors
///
/// Returns `BackendIo` if credentials cannot be loaded or the spreadsheet
/// cannot be reached.
pub async fn open(config: &SweepConfig) -> Result<Arc<dyn TableBackend>> {
    match &config.backend {
        BackendConfig::DelimitedFile {
            path,
            delimiter,
            lock_timeout_ms,
        } => {
            let backend = DelimitedFileBackend::new(path, *delimiter)?
                .with_lock_timeout(std::time::Duration::from_millis(*lock_timeout_ms));
            Ok(Arc::new(backend))
        }
        BackendConfig::Sheets {
            spreadsheet_id,
            credentials_path,
            worksheet,
            api_base,
        } => {
            let transport = HttpSheetTransport::connect(
                api_base,
                spreadsheet_id,
                credentials_path.as_deref(),
            )
            .await?;
            let backend = SheetsBackend::open(
                Arc::new(transport),
                worksheet.clone(),
                config.retry,
                config.claim,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
