//! Remote spreadsheet table backend.
//!
//! The spreadsheet offers no row locking, so claims are optimistic:
//!
//! 1. Read the worksheet and pick the first eligible row.
//! 2. Write the claim cells together with a unique marker in `comment`.
//! 3. Wait [`ClaimPolicy::verify_delay`], re-read, and check the marker and
//!    status survived.
//! 4. On success replace the marker with the intended comment and return
//!    the row. On a clobbered write, start over from a fresh read.
//!
//! Once the claim write has landed the row is not abandoned lightly: the
//! verify read is retried for several rounds, and a verified claim is
//! returned even if the marker cannot be cleared. Only when the sheet stays
//! unreadable are the claim cells written back to their previous values,
//! best-effort, before the error is returned.
//!
//! After [`ClaimPolicy::max_contention_retries`] lost races the claim fails
//! with `Contention`. Exclusion holds as long as no rival takes longer than
//! the verify delay between its read and its write; the delay should be
//! sized above the worst expected request latency.
//!
//! Every network call goes through [`with_retry`] with its own timeout.

mod http;
mod memory;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sweep_core::config::{ClaimPolicy, RetryPolicy};
use sweep_core::error::{Error, Result};
use sweep_core::row::{FieldChanges, Row, RowId};
use ulid::Ulid;

pub use http::HttpSheetTransport;
pub use memory::MemorySheet;
pub use transport::{CellUpdate, SheetTransport};

use super::layout::TableLayout;
use super::{Eligibility, TableBackend};
use crate::metrics::record_claim_conflict;
use crate::retry::{rand_jitter, with_retry};

/// Prefix of the claim marker written into the `comment` cell.
pub const CLAIM_MARKER_PREFIX: &str = "claim:";

const KIND: &str = "sheets";

/// Rounds of verify reads after a claim write before the claim is abandoned.
const VERIFY_ROUNDS: u32 = 3;

/// Parameter table stored in one worksheet of a remote spreadsheet.
pub struct SheetsBackend {
    transport: Arc<dyn SheetTransport>,
    worksheet: String,
    retry: RetryPolicy,
    claim: ClaimPolicy,
}

impl std::fmt::Debug for SheetsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetsBackend")
            .field("worksheet", &self.worksheet)
            .field("retry", &self.retry)
            .field("claim", &self.claim)
            .finish_non_exhaustive()
    }
}

/// Converts a 0-based record index (header excluded) to a 1-based sheet row.
const fn sheet_row(record_index: usize) -> usize {
    record_index + 2
}

impl SheetsBackend {
    /// Opens the backend, resolving the worksheet title.
    ///
    /// Without a title the first worksheet is used.
    ///
    /// # Errors
    ///
    /// Returns `BackendIo` if the spreadsheet cannot be reached, or
    /// `Configuration` if the worksheet does not exist.
    pub async fn open(
        transport: Arc<dyn SheetTransport>,
        worksheet: Option<String>,
        retry: RetryPolicy,
        claim: ClaimPolicy,
    ) -> Result<Self> {
        let titles = with_retry(&retry, "sheets.worksheets", || transport.worksheets()).await?;
        let worksheet = match worksheet {
            Some(title) if titles.contains(&title) => title,
            Some(title) => {
                return Err(Error::configuration(format!(
                    "worksheet '{title}' not found (available: {})",
                    titles.join(", ")
                )));
            }
            None => titles
                .into_iter()
                .next()
                .ok_or_else(|| Error::configuration("spreadsheet has no worksheets"))?,
        };

        tracing::debug!(worksheet = %worksheet, "opened sheets backend");
        Ok(Self {
            transport,
            worksheet,
            retry,
            claim,
        })
    }

    /// Returns the worksheet title in use.
    #[must_use]
    pub fn worksheet(&self) -> &str {
        &self.worksheet
    }

    async fn read_table(&self) -> Result<(TableLayout, Vec<Vec<String>>)> {
        let mut values = with_retry(&self.retry, "sheets.read", || {
            self.transport.read_values(&self.worksheet)
        })
        .await?;
        if values.is_empty() {
            return Err(Error::schema(format!(
                "worksheet '{}' has no header row",
                self.worksheet
            )));
        }

        let header = values.remove(0);
        let layout = TableLayout::from_header(header)?;
        for record in &mut values {
            layout.normalize(record);
        }
        Ok((layout, values))
    }

    async fn write(&self, cells: &[CellUpdate]) -> Result<()> {
        with_retry(&self.retry, "sheets.write", || {
            self.transport.write_cells(&self.worksheet, cells)
        })
        .await
    }

    /// One optimistic claim attempt.
    async fn try_claim(
        &self,
        eligible: &Eligibility<'_>,
        changes: &FieldChanges,
    ) -> Result<Attempt> {
        let (layout, mut records) = self.read_table().await?;
        let Some((index, mut row)) = layout
            .parse_indexed(&records)?
            .into_iter()
            .find(|(_, row)| eligible(row))
        else {
            return Ok(Attempt::NothingEligible);
        };

        changes.apply(&mut row)?;
        let original = records[index].clone();
        let marker = format!("{CLAIM_MARKER_PREFIX}{}", Ulid::new());
        let mut cells: Vec<CellUpdate> = layout
            .write_changes(&mut records[index], &row, changes)
            .into_iter()
            .filter(|(column, _)| *column != layout.comment_column())
            .map(|(column, value)| CellUpdate {
                row: sheet_row(index),
                column,
                value,
            })
            .collect();
        cells.push(CellUpdate {
            row: sheet_row(index),
            column: layout.comment_column(),
            value: marker.clone(),
        });
        self.write(&cells).await?;

        let (layout, records) = match self.verify_read().await {
            Ok(table) => table,
            Err(err) => {
                self.release(&cells, &original).await;
                return Err(err);
            }
        };
        let position = layout.position_of(&records, row.id.as_str());
        let survived = position.and_then(|i| records.get(i)).is_some_and(|record| {
            record[layout.comment_column()] == marker
                && record[layout.status_column()] == row.status.as_str()
        });
        if !survived {
            return Ok(Attempt::Clobbered);
        }

        let final_comment = CellUpdate {
            row: sheet_row(position.unwrap_or(index)),
            column: layout.comment_column(),
            value: row.comment.clone().unwrap_or_default(),
        };
        if let Err(err) = self.write(std::slice::from_ref(&final_comment)).await {
            tracing::warn!(
                row_id = %row.id,
                error = %err,
                "claim verified but marker could not be cleared"
            );
        }
        Ok(Attempt::Claimed(row))
    }

    /// Waits out the verify delay and re-reads, retrying for a few rounds.
    async fn verify_read(&self) -> Result<(TableLayout, Vec<Vec<String>>)> {
        let mut round = 1;
        loop {
            tokio::time::sleep(self.claim.verify_delay()).await;
            match self.read_table().await {
                Ok(table) => return Ok(table),
                Err(err @ Error::BackendIo { .. }) if round < VERIFY_ROUNDS => {
                    tracing::warn!(error = %err, round, "verify read failed, retrying");
                    round += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes the claimed cells back to their values before the claim.
    async fn release(&self, claimed: &[CellUpdate], original: &[String]) {
        let cells: Vec<CellUpdate> = claimed
            .iter()
            .map(|cell| CellUpdate {
                row: cell.row,
                column: cell.column,
                value: original.get(cell.column).cloned().unwrap_or_default(),
            })
            .collect();
        let sheet_row = cells.first().map_or(0, |cell| cell.row);
        match self.write(&cells).await {
            Ok(()) => tracing::warn!(sheet_row, "claim could not be verified, row released"),
            Err(err) => tracing::error!(
                sheet_row,
                error = %err,
                "claim could not be verified or released"
            ),
        }
    }
}

enum Attempt {
    NothingEligible,
    Claimed(Row),
    Clobbered,
}

#[async_trait]
impl TableBackend for SheetsBackend {
    async fn read_all(&self) -> Result<Vec<Row>> {
        let (layout, records) = self.read_table().await?;
        layout.parse_rows(&records)
    }

    async fn claim_next(
        &self,
        eligible: &Eligibility<'_>,
        changes: &FieldChanges,
    ) -> Result<Option<Row>> {
        let started = Instant::now();
        let mut conflicts = 0;

        loop {
            match self.try_claim(eligible, changes).await? {
                Attempt::NothingEligible => return Ok(None),
                Attempt::Claimed(row) => {
                    tracing::debug!(
                        row_id = %row.id,
                        conflicts,
                        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "claimed row"
                    );
                    return Ok(Some(row));
                }
                Attempt::Clobbered => {
                    conflicts += 1;
                    record_claim_conflict(KIND);
                    tracing::warn!(
                        conflicts,
                        max = self.claim.max_contention_retries,
                        "claim overwritten by another worker"
                    );
                    if conflicts >= self.claim.max_contention_retries {
                        return Err(Error::Contention {
                            attempts: conflicts,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(rand_jitter())).await;
                }
            }
        }
    }

    async fn update(&self, id: &RowId, changes: &FieldChanges) -> Result<Row> {
        let (layout, mut records) = self.read_table().await?;
        let index = layout
            .position_of(&records, id.as_str())
            .ok_or_else(|| Error::not_found(id.as_str()))?;
        let mut row = layout.parse_row(&records[index])?;

        changes.apply(&mut row)?;
        let cells: Vec<CellUpdate> = layout
            .write_changes(&mut records[index], &row, changes)
            .into_iter()
            .map(|(column, value)| CellUpdate {
                row: sheet_row(index),
                column,
                value,
            })
            .collect();
        self.write(&cells).await?;
        Ok(row)
    }

    fn kind(&self) -> &'static str {
        KIND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_core::status::Status;

    fn policies() -> (RetryPolicy, ClaimPolicy) {
        (
            RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                request_timeout_ms: 1_000,
            },
            ClaimPolicy {
                max_contention_retries: 3,
                verify_delay_ms: 1,
            },
        )
    }

    fn sheet() -> Arc<MemorySheet> {
        Arc::new(
            MemorySheet::new()
                .with_worksheet("notes", vec![vec!["unrelated"]])
                .with_worksheet(
                    "runs",
                    vec![
                        vec!["id", "status", "start-time", "end-time", "comment", "./overall/max_time"],
                        vec!["test1", "", "", "", "old note", "2880"],
                        vec!["test2", "", "", "", "", "1440"],
                    ],
                ),
        )
    }

    async fn backend_for(sheet: &Arc<MemorySheet>, worksheet: &str) -> SheetsBackend {
        let (retry, claim) = policies();
        let transport: Arc<dyn SheetTransport> = Arc::clone(sheet) as Arc<dyn SheetTransport>;
        SheetsBackend::open(transport, Some(worksheet.into()), retry, claim)
            .await
            .unwrap()
    }

    async fn backend(sheet: &Arc<MemorySheet>) -> SheetsBackend {
        backend_for(sheet, "runs").await
    }

    fn pending(row: &Row) -> bool {
        row.status.is_pending()
    }

    fn claim_changes() -> FieldChanges {
        FieldChanges::new()
            .status(Status::Claimed)
            .start_time(chrono::Utc::now())
            .clear_comment()
    }

    #[tokio::test]
    async fn claim_writes_cells_and_clears_marker() {
        let sheet = sheet();
        let backend = backend(&sheet).await;

        let row = backend.claim_next(&pending, &claim_changes()).await.unwrap().unwrap();

        assert_eq!(row.id.as_str(), "test1");
        let values = sheet.values("runs").unwrap();
        assert_eq!(values[1][1], "claimed");
        assert!(!values[1][2].is_empty());
        assert_eq!(values[1][4], "");
        assert_eq!(values[1][5], "2880");
        assert_eq!(values[2][1], "");
    }

    #[tokio::test]
    async fn first_worksheet_is_default() {
        let sheet = sheet();
        let (retry, claim) = policies();
        let backend = SheetsBackend::open(sheet, None, retry, claim).await.unwrap();
        assert_eq!(backend.worksheet(), "notes");
    }

    #[tokio::test]
    async fn unknown_worksheet_is_configuration_error() {
        let (retry, claim) = policies();
        let err = SheetsBackend::open(sheet(), Some("missing".into()), retry, claim)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn transient_read_failures_are_absorbed() {
        let sheet = sheet();
        let backend = backend(&sheet).await;
        sheet.fail_next_reads(2);

        let rows = backend.read_all().await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn persistent_failures_surface_as_backend_io() {
        let sheet = sheet();
        let backend = backend(&sheet).await;
        sheet.fail_next_writes(10);

        let err = backend.claim_next(&pending, &claim_changes()).await.unwrap_err();
        assert!(matches!(err, Error::BackendIo { .. }));
    }

    #[tokio::test]
    async fn blank_rows_are_skipped() {
        let sheet = Arc::new(MemorySheet::new().with_worksheet(
            "runs",
            vec![
                vec!["id", "status", "start-time", "end-time", "comment"],
                vec!["a"],
                vec![],
                vec!["b"],
            ],
        ));
        let backend = backend_for(&sheet, "runs").await;

        let first = backend.claim_next(&pending, &claim_changes()).await.unwrap().unwrap();
        let second = backend.claim_next(&pending, &claim_changes()).await.unwrap().unwrap();

        assert_eq!(first.id.as_str(), "a");
        assert_eq!(second.id.as_str(), "b");
        assert!(backend.claim_next(&pending, &claim_changes()).await.unwrap().is_none());

        let done = FieldChanges::new()
            .status(Status::Success)
            .end_time(chrono::Utc::now());
        backend.update(&second.id, &done).await.unwrap();
        let values = sheet.values("runs").unwrap();
        assert_eq!(values[3][1], "success");
        assert!(values[2].iter().all(String::is_empty));
    }

    #[tokio::test]
    async fn update_rejects_terminal_rows() {
        let sheet = sheet();
        let backend = backend(&sheet).await;
        let row = backend.claim_next(&pending, &claim_changes()).await.unwrap().unwrap();

        let fail = FieldChanges::new()
            .status(Status::Failed)
            .end_time(chrono::Utc::now())
            .comment("exit code 3");
        backend.update(&row.id, &fail).await.unwrap();
        assert_eq!(sheet.values("runs").unwrap()[1][4], "exit code 3");

        let err = backend.update(&row.id, &fail).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let err = backend.update(&RowId::from("nope"), &fail).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
