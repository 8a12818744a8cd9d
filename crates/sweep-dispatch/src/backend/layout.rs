//! Mapping between raw table records and typed rows.
//!
//! Both backends see the table as a header plus records of string cells.
//! [`TableLayout`] resolves the metadata columns once per read and converts
//! in both directions. Writes only touch the cells a change set names, so
//! unknown columns and untouched cells survive a round trip unchanged.

use std::collections::{HashMap, HashSet};

use sweep_core::error::{Error, Result};
use sweep_core::row::{
    COMMENT_COLUMN, END_TIME_COLUMN, FieldChanges, ID_COLUMN, PERFORMED_BY_COLUMN,
    REQUIRED_STRENGTH_COLUMN, Row, START_TIME_COLUMN, STATUS_COLUMN, format_timestamp,
    is_metadata_column, parse_timestamp,
};
use sweep_core::status::Status;

/// Column positions resolved from a table header.
#[derive(Debug, Clone)]
pub struct TableLayout {
    header: Vec<String>,
    id: usize,
    status: usize,
    start_time: usize,
    end_time: usize,
    comment: usize,
    performed_by: Option<usize>,
    required_strength: Option<usize>,
}

impl TableLayout {
    /// Resolves the layout from a header record.
    ///
    /// # Errors
    ///
    /// Returns `Schema` if a required column is missing or a column name
    /// appears twice.
    pub fn from_header(header: Vec<String>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(header.len());
        for (index, name) in header.iter().enumerate() {
            let name = name.trim();
            if positions.insert(name.to_string(), index).is_some() {
                return Err(Error::schema(format!("duplicate column '{name}'")));
            }
        }

        let required = |name: &str| {
            positions
                .get(name)
                .copied()
                .ok_or_else(|| Error::schema(format!("missing required column '{name}'")))
        };

        Ok(Self {
            id: required(ID_COLUMN)?,
            status: required(STATUS_COLUMN)?,
            start_time: required(START_TIME_COLUMN)?,
            end_time: required(END_TIME_COLUMN)?,
            comment: required(COMMENT_COLUMN)?,
            performed_by: positions.get(PERFORMED_BY_COLUMN).copied(),
            required_strength: positions.get(REQUIRED_STRENGTH_COLUMN).copied(),
            header,
        })
    }

    /// Returns the header as read.
    #[must_use]
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Returns the position of the `comment` column.
    #[must_use]
    pub const fn comment_column(&self) -> usize {
        self.comment
    }

    /// Returns the position of the `status` column.
    #[must_use]
    pub const fn status_column(&self) -> usize {
        self.status
    }

    /// Pads or leaves a record so every header column has a cell.
    pub fn normalize(&self, record: &mut Vec<String>) {
        if record.len() < self.header.len() {
            record.resize(self.header.len(), String::new());
        }
    }

    /// Converts one record into a typed row.
    ///
    /// # Errors
    ///
    /// Returns `Schema` if the id cell is empty or the strength cell is not
    /// a number.
    pub fn parse_row(&self, record: &[String]) -> Result<Row> {
        let cell = |index: usize| record.get(index).map_or("", String::as_str);

        let id = cell(self.id).trim();
        if id.is_empty() {
            return Err(Error::schema("row with an empty id"));
        }

        let mut row = Row::new(id);
        row.status = cell(self.status).parse::<Status>().unwrap_or_default();
        row.start_time = parse_timestamp(cell(self.start_time));
        row.end_time = parse_timestamp(cell(self.end_time));
        row.comment = Some(cell(self.comment))
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        row.performed_by = self
            .performed_by
            .map(cell)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        row.required_strength = match self.required_strength.map(cell).map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(raw.parse::<f64>().map_err(|_| {
                Error::schema(format!(
                    "row {id}: {REQUIRED_STRENGTH_COLUMN} '{raw}' is not a number"
                ))
            })?),
            _ => None,
        };

        for (index, name) in self.header.iter().enumerate() {
            let name = name.trim();
            if !is_metadata_column(name) {
                row.parameters.insert(name.to_string(), cell(index).to_string());
            }
        }
        Ok(row)
    }

    /// Converts every record, rejecting duplicate ids.
    ///
    /// # Errors
    ///
    /// Returns `Schema` on the first malformed row or duplicate id.
    pub fn parse_rows(&self, records: &[Vec<String>]) -> Result<Vec<Row>> {
        Ok(self
            .parse_indexed(records)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    /// Converts every record, pairing each row with its record index.
    ///
    /// Blank records (every cell empty) are skipped, so indices may have
    /// gaps. Writes go back through the returned index.
    ///
    /// # Errors
    ///
    /// Returns `Schema` on the first malformed row or duplicate id.
    pub fn parse_indexed(&self, records: &[Vec<String>]) -> Result<Vec<(usize, Row)>> {
        let mut seen = HashSet::with_capacity(records.len());
        let mut rows = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            if is_blank(record) {
                continue;
            }
            let row = self.parse_row(record)?;
            if !seen.insert(row.id.clone()) {
                return Err(Error::schema(format!("duplicate row id '{}'", row.id)));
            }
            rows.push((index, row));
        }
        Ok(rows)
    }

    /// Writes the cells named by `changes` from the already-updated `row`
    /// into `record`.
    ///
    /// Returns the positions and values of the cells written.
    pub fn write_changes(
        &self,
        record: &mut Vec<String>,
        row: &Row,
        changes: &FieldChanges,
    ) -> Vec<(usize, String)> {
        self.normalize(record);
        let mut written = Vec::new();
        let mut put = |index: usize, value: String| {
            record[index].clone_from(&value);
            written.push((index, value));
        };

        if changes.status.is_some() {
            put(self.status, row.status.as_str().to_string());
        }
        if changes.start_time.is_some() {
            put(
                self.start_time,
                row.start_time.as_ref().map(format_timestamp).unwrap_or_default(),
            );
        }
        if changes.end_time.is_some() {
            put(
                self.end_time,
                row.end_time.as_ref().map(format_timestamp).unwrap_or_default(),
            );
        }
        if changes.comment.is_some() {
            put(self.comment, row.comment.clone().unwrap_or_default());
        }
        if let (Some(index), Some(_)) = (self.performed_by, &changes.performed_by) {
            put(index, row.performed_by.clone().unwrap_or_default());
        }
        written
    }

    /// Finds the record index of the row with the given id.
    #[must_use]
    pub fn position_of(&self, records: &[Vec<String>], id: &str) -> Option<usize> {
        records
            .iter()
            .position(|record| record.get(self.id).is_some_and(|cell| cell.trim() == id))
    }
}

/// True when a record holds no data at all.
fn is_blank(record: &[String]) -> bool {
    record.iter().all(|cell| cell.trim().is_empty())
}
