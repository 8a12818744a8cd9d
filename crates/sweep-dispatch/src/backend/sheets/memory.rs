//! In-memory spreadsheet for tests.
//!
//! Behaves like the remote API (trailing empty cells are dropped on read)
//! and can inject failures: transient read/write errors, claim markers
//! overwritten by a rival worker right after they land, and outages that
//! begin just after a claim marker is written.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::CLAIM_MARKER_PREFIX;
use super::transport::{CellUpdate, SheetTransport, TransportResult};
use crate::retry::TransportError;

/// Thread-safe in-memory spreadsheet. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemorySheet {
    state: Mutex<SheetState>,
}

#[derive(Debug, Default)]
struct SheetState {
    worksheets: Vec<(String, Vec<Vec<String>>)>,
    failing_reads: u32,
    failing_writes: u32,
    clobbered_claims: u32,
    reads_failing_after_claim: u32,
    writes_failing_after_claim: u32,
    rivals: u32,
    reads: u64,
    writes: u64,
}

fn poison_err<T>(_: PoisonError<T>) -> TransportError {
    TransportError::Fatal("memory sheet lock poisoned".into())
}

impl MemorySheet {
    /// Creates an empty spreadsheet with no worksheets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worksheet holding `rows` (header first).
    #[must_use]
    pub fn with_worksheet<R, C>(self, title: impl Into<String>, rows: R) -> Self
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(Into::into).collect())
            .collect();
        if let Ok(mut state) = self.state.lock() {
            state.worksheets.push((title.into(), rows));
        }
        self
    }

    /// Makes the next `n` reads fail transiently.
    pub fn fail_next_reads(&self, n: u32) {
        self.with_state(|state| state.failing_reads += n);
    }

    /// Makes the next `n` writes fail transiently.
    pub fn fail_next_writes(&self, n: u32) {
        self.with_state(|state| state.failing_writes += n);
    }

    /// Once the next claim marker lands, fails the following `reads` reads
    /// and `writes` writes transiently.
    pub fn fail_after_next_claim(&self, reads: u32, writes: u32) {
        self.with_state(|state| {
            state.reads_failing_after_claim += reads;
            state.writes_failing_after_claim += writes;
        });
    }

    /// Overwrites the next `n` claim markers with a rival's marker right
    /// after they are written.
    pub fn clobber_next_claims(&self, n: u32) {
        self.with_state(|state| state.clobbered_claims += n);
    }

    /// Returns a copy of a worksheet's cells.
    #[must_use]
    pub fn values(&self, worksheet: &str) -> Option<Vec<Vec<String>>> {
        self.state.lock().ok().and_then(|state| {
            state
                .worksheets
                .iter()
                .find(|(title, _)| title == worksheet)
                .map(|(_, rows)| rows.clone())
        })
    }

    /// Number of successful reads served.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.state.lock().map_or(0, |state| state.reads)
    }

    /// Number of successful batch writes applied.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.state.lock().map_or(0, |state| state.writes)
    }

    fn with_state(&self, f: impl FnOnce(&mut SheetState)) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    fn lock(&self) -> TransportResult<MutexGuard<'_, SheetState>> {
        self.state.lock().map_err(poison_err)
    }
}

impl SheetState {
    fn worksheet_mut(&mut self, title: &str) -> TransportResult<&mut Vec<Vec<String>>> {
        self.worksheets
            .iter_mut()
            .find(|(name, _)| name == title)
            .map(|(_, rows)| rows)
            .ok_or_else(|| TransportError::Fatal(format!("HTTP 400: unable to parse range: {title}")))
    }
}

fn set_cell(rows: &mut Vec<Vec<String>>, row: usize, column: usize, value: &str) {
    let index = row.saturating_sub(1);
    if rows.len() <= index {
        rows.resize_with(index + 1, Vec::new);
    }
    let cells = &mut rows[index];
    if cells.len() <= column {
        cells.resize(column + 1, String::new());
    }
    value.clone_into(&mut cells[column]);
}

#[async_trait]
impl SheetTransport for MemorySheet {
    async fn worksheets(&self) -> TransportResult<Vec<String>> {
        let state = self.lock()?;
        Ok(state.worksheets.iter().map(|(title, _)| title.clone()).collect())
    }

    async fn read_values(&self, worksheet: &str) -> TransportResult<Vec<Vec<String>>> {
        let mut state = self.lock()?;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(TransportError::Transient("HTTP 503: backend unavailable".into()));
        }
        state.reads += 1;

        let mut rows = state.worksheet_mut(worksheet)?.clone();
        for row in &mut rows {
            while row.last().is_some_and(String::is_empty) {
                row.pop();
            }
        }
        while rows.last().is_some_and(Vec::is_empty) {
            rows.pop();
        }
        Ok(rows)
    }

    async fn write_cells(&self, worksheet: &str, cells: &[CellUpdate]) -> TransportResult<()> {
        let mut state = self.lock()?;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(TransportError::Transient("HTTP 429: rate limited".into()));
        }
        state.writes += 1;

        let marks_claim = cells
            .iter()
            .any(|cell| cell.value.starts_with(CLAIM_MARKER_PREFIX));
        if marks_claim {
            let reads = std::mem::take(&mut state.reads_failing_after_claim);
            let writes = std::mem::take(&mut state.writes_failing_after_claim);
            state.failing_reads += reads;
            state.failing_writes += writes;
        }
        let clobber = marks_claim && state.clobbered_claims > 0;
        let rival = if clobber {
            state.clobbered_claims -= 1;
            state.rivals += 1;
            Some(format!("{CLAIM_MARKER_PREFIX}rival-{}", state.rivals))
        } else {
            None
        };

        let rows = state.worksheet_mut(worksheet)?;
        for cell in cells {
            set_cell(rows, cell.row, cell.column, &cell.value);
        }
        if let Some(rival) = rival {
            for cell in cells
                .iter()
                .filter(|cell| cell.value.starts_with(CLAIM_MARKER_PREFIX))
            {
                set_cell(rows, cell.row, cell.column, &rival);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet() -> MemorySheet {
        MemorySheet::new().with_worksheet(
            "runs",
            vec![
                vec!["id", "status", "start-time", "end-time", "comment", "x"],
                vec!["a", "", "", "", "", "1"],
            ],
        )
    }

    #[tokio::test]
    async fn reads_drop_trailing_empty_cells() {
        let sheet = sheet();
        let rows = sheet.read_values("runs").await.unwrap();
        assert_eq!(rows[1], vec!["a", "", "", "", "", "1"]);

        sheet
            .write_cells(
                "runs",
                &[CellUpdate {
                    row: 2,
                    column: 5,
                    value: String::new(),
                }],
            )
            .await
            .unwrap();
        let rows = sheet.read_values("runs").await.unwrap();
        assert_eq!(rows[1], vec!["a"]);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_consumed() {
        let sheet = sheet();
        sheet.fail_next_reads(1);

        assert!(sheet.read_values("runs").await.unwrap_err().is_transient());
        assert!(sheet.read_values("runs").await.is_ok());
        assert_eq!(sheet.read_count(), 1);
    }

    #[tokio::test]
    async fn clobbered_claim_leaves_rival_marker() {
        let sheet = sheet();
        sheet.clobber_next_claims(1);

        let marker = format!("{CLAIM_MARKER_PREFIX}mine");
        sheet
            .write_cells(
                "runs",
                &[CellUpdate {
                    row: 2,
                    column: 4,
                    value: marker.clone(),
                }],
            )
            .await
            .unwrap();

        let values = sheet.values("runs").unwrap();
        assert_ne!(values[1][4], marker);
        assert!(values[1][4].starts_with(CLAIM_MARKER_PREFIX));
    }

    #[tokio::test]
    async fn outage_starts_after_claim_marker() {
        let sheet = sheet();
        sheet.fail_after_next_claim(1, 1);
        assert!(sheet.read_values("runs").await.is_ok());

        let marker = CellUpdate {
            row: 2,
            column: 4,
            value: format!("{CLAIM_MARKER_PREFIX}mine"),
        };
        sheet.write_cells("runs", std::slice::from_ref(&marker)).await.unwrap();

        assert!(sheet.read_values("runs").await.is_err());
        assert!(sheet.write_cells("runs", &[marker]).await.is_err());
        assert!(sheet.read_values("runs").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_worksheet_is_fatal() {
        let err = sheet().read_values("missing").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
