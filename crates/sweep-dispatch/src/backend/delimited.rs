//! Delimited-file table backend.
//!
//! The table is a header row plus records, quoted per RFC 4180 with a
//! configurable delimiter. Mutations follow the same sequence every time:
//!
//! 1. Take an exclusive advisory lock on `<table>.lock` (polling with
//!    bounded backoff until the lock timeout).
//! 2. Re-read the table from disk.
//! 3. Decide and apply the change.
//! 4. Write the whole table to a temporary sibling and rename it over the
//!    original.
//! 5. Release the lock.
//!
//! The lock lives on a sibling because the table itself is replaced on every
//! write. Reads without the lock always see a complete table.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sweep_core::error::{Error, Result};
use sweep_core::row::{FieldChanges, Row, RowId};
use ulid::Ulid;

use super::layout::TableLayout;
use super::{Eligibility, TableBackend};
use crate::retry::rand_jitter;

/// Default time to wait for the table lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Base backoff while polling the lock.
const BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Maximum backoff while polling the lock.
const BACKOFF_MAX: Duration = Duration::from_millis(500);

const KIND: &str = "delimited_file";

/// Parameter table stored as a delimited text file.
#[derive(Debug, Clone)]
pub struct DelimitedFileBackend {
    path: PathBuf,
    lock_path: PathBuf,
    delimiter: u8,
    lock_timeout: Duration,
}

impl DelimitedFileBackend {
    /// Creates a backend for the table at `path`.
    ///
    /// The file is not touched until the first operation.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the delimiter is not a single-byte character
    /// or the path has no file name.
    pub fn new(path: impl Into<PathBuf>, delimiter: char) -> Result<Self> {
        let path = path.into();
        let delimiter = u8::try_from(delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                Error::configuration(format!("delimiter {delimiter:?} is not ASCII"))
            })?;
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                Error::configuration(format!("table path {} has no file name", path.display()))
            })?
            .to_string_lossy()
            .into_owned();
        let lock_path = path.with_file_name(format!("{file_name}.lock"));

        Ok(Self {
            path,
            lock_path,
            delimiter,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Sets how long mutations wait for the table lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Returns the table path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the sibling lock file path.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquires the exclusive table lock, released when the file is dropped.
    async fn lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                Error::backend_io_with_source(
                    format!("failed to open lock file {}", self.lock_path.display()),
                    e,
                )
            })?;

        let deadline = Instant::now() + self.lock_timeout;
        let mut backoff = BACKOFF_BASE;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(file),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => {
                    return Err(Error::backend_io_with_source(
                        format!("failed to lock {}", self.lock_path.display()),
                        e,
                    ));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::backend_io(format!(
                    "timed out after {}ms waiting for table lock {}",
                    self.lock_timeout.as_millis(),
                    self.lock_path.display()
                )));
            }
            let delay = (backoff + Duration::from_millis(rand_jitter())).min(deadline - now);
            tracing::trace!(lock = %self.lock_path.display(), ?delay, "table lock busy");
            tokio::time::sleep(delay).await;
            backoff = backoff.saturating_mul(2).min(BACKOFF_MAX);
        }
    }

    async fn load(&self) -> Result<Table> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::backend_io_with_source(
                format!("failed to read table {}", self.path.display()),
                e,
            )
        })?;
        Table::parse(&bytes, self.delimiter)
    }

    async fn store(&self, table: &Table) -> Result<()> {
        let bytes = table.to_bytes(self.delimiter)?;
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Ulid::new()));

        let written = async {
            tokio::fs::write(&temp, &bytes).await?;
            tokio::fs::OpenOptions::new()
                .write(true)
                .open(&temp)
                .await?
                .sync_all()
                .await?;
            tokio::fs::rename(&temp, &self.path).await
        }
        .await;

        if let Err(e) = written {
            tokio::fs::remove_file(&temp).await.ok();
            return Err(Error::backend_io_with_source(
                format!("failed to write table {}", self.path.display()),
                e,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TableBackend for DelimitedFileBackend {
    async fn read_all(&self) -> Result<Vec<Row>> {
        self.load().await?.rows()
    }

    async fn claim_next(
        &self,
        eligible: &Eligibility<'_>,
        changes: &FieldChanges,
    ) -> Result<Option<Row>> {
        let lock = self.lock().await?;
        let mut table = self.load().await?;

        let Some((index, mut row)) = table
            .indexed_rows()?
            .into_iter()
            .find(|(_, row)| eligible(row))
        else {
            return Ok(None);
        };

        changes.apply(&mut row)?;
        let Table { layout, records } = &mut table;
        layout.write_changes(&mut records[index], &row, changes);
        self.store(&table).await?;
        drop(lock);

        tracing::debug!(row_id = %row.id, table = %self.path.display(), "claimed row");
        Ok(Some(row))
    }

    async fn update(&self, id: &RowId, changes: &FieldChanges) -> Result<Row> {
        let lock = self.lock().await?;
        let mut table = self.load().await?;

        let (index, mut row) = table
            .indexed_rows()?
            .into_iter()
            .find(|(_, row)| row.id == *id)
            .ok_or_else(|| Error::not_found(id.as_str()))?;

        changes.apply(&mut row)?;
        let Table { layout, records } = &mut table;
        layout.write_changes(&mut records[index], &row, changes);
        self.store(&table).await?;
        drop(lock);

        Ok(row)
    }

    fn kind(&self) -> &'static str {
        KIND
    }
}

/// In-memory copy of the table between read and write.
struct Table {
    layout: TableLayout,
    records: Vec<Vec<String>>,
}

impl Table {
    fn parse(bytes: &[u8], delimiter: u8) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| Error::schema(format!("unreadable record: {e}")))?;
            records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }
        if records.is_empty() {
            return Err(Error::schema("table has no header row"));
        }

        let header = records.remove(0);
        let layout = TableLayout::from_header(header)?;
        for record in &mut records {
            layout.normalize(record);
        }
        Ok(Self { layout, records })
    }

    fn rows(&self) -> Result<Vec<Row>> {
        self.layout.parse_rows(&self.records)
    }

    fn indexed_rows(&self) -> Result<Vec<(usize, Row)>> {
        self.layout.parse_indexed(&self.records)
    }

    fn to_bytes(&self, delimiter: u8) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_writer(Vec::new());

        let encode = |e: csv::Error| Error::backend_io_with_source("failed to encode table", e);
        writer.write_record(self.layout.header()).map_err(encode)?;
        for record in &self.records {
            writer.write_record(record).map_err(encode)?;
        }
        writer.into_inner().map_err(|e| {
            Error::backend_io(format!("failed to encode table: {}", e.error()))
        })
    }
}
