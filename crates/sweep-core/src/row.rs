//! Parameter-set rows and the field changes applied to them.
//!
//! A [`Row`] is the typed view of one record in the parameter table. Rows are
//! created externally, mutated only through [`FieldChanges`] (which enforce
//! the status state machine), and never deleted.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::status::Status;

/// Column holding the row identifier.
pub const ID_COLUMN: &str = "id";
/// Column holding the status.
pub const STATUS_COLUMN: &str = "status";
/// Column holding the claim timestamp.
pub const START_TIME_COLUMN: &str = "start-time";
/// Column holding the completion timestamp.
pub const END_TIME_COLUMN: &str = "end-time";
/// Column holding free-text diagnostics.
pub const COMMENT_COLUMN: &str = "comment";
/// Optional column recording which worker claimed the row.
pub const PERFORMED_BY_COLUMN: &str = "performed-by";
/// Optional column restricting which workers may claim the row.
pub const REQUIRED_STRENGTH_COLUMN: &str = "required-computer-strength";

/// Columns every table must carry.
pub const REQUIRED_COLUMNS: [&str; 5] = [
    ID_COLUMN,
    STATUS_COLUMN,
    START_TIME_COLUMN,
    END_TIME_COLUMN,
    COMMENT_COLUMN,
];

/// Returns true if the column is row metadata rather than a parameter.
#[must_use]
pub fn is_metadata_column(name: &str) -> bool {
    REQUIRED_COLUMNS.contains(&name)
        || name == PERFORMED_BY_COLUMN
        || name == REQUIRED_STRENGTH_COLUMN
}

/// Identifier of a row, assigned by whoever populated the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    /// Wraps an externally assigned identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RowId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for RowId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One parameter set and its run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Unique, immutable identifier.
    pub id: RowId,
    /// Current status.
    pub status: Status,
    /// When the row was claimed.
    pub start_time: Option<DateTime<Utc>>,
    /// When the row reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Diagnostic detail, set on failure.
    pub comment: Option<String>,
    /// Worker identity recorded on claim, if the table tracks it.
    pub performed_by: Option<String>,
    /// Minimum worker strength needed to claim this row, if any.
    pub required_strength: Option<f64>,
    /// Parameter key-paths mapped to their raw cell values.
    pub parameters: BTreeMap<String, String>,
}

impl Row {
    /// Creates a pending row with no parameters.
    #[must_use]
    pub fn new(id: impl Into<RowId>) -> Self {
        Self {
            id: id.into(),
            status: Status::Pending,
            start_time: None,
            end_time: None,
            comment: None,
            performed_by: None,
            required_strength: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Adds a parameter value.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// A set of metadata changes to apply to a single row.
///
/// `None` fields are left untouched. Setting `comment` to an empty string
/// clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldChanges {
    /// New status; validated against the state machine when applied.
    pub status: Option<Status>,
    /// New claim timestamp.
    pub start_time: Option<DateTime<Utc>>,
    /// New completion timestamp.
    pub end_time: Option<DateTime<Utc>>,
    /// New comment (empty clears).
    pub comment: Option<String>,
    /// New worker identity.
    pub performed_by: Option<String>,
}

impl FieldChanges {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target status.
    #[must_use]
    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the claim timestamp.
    #[must_use]
    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    /// Sets the completion timestamp.
    #[must_use]
    pub fn end_time(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    /// Sets the comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Clears the comment.
    #[must_use]
    pub fn clear_comment(mut self) -> Self {
        self.comment = Some(String::new());
        self
    }

    /// Sets the worker identity.
    #[must_use]
    pub fn performed_by(mut self, who: impl Into<String>) -> Self {
        self.performed_by = Some(who.into());
        self
    }

    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the changes to `row`, enforcing the status state machine.
    ///
    /// The row is left untouched when the transition is rejected.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the status change is not allowed.
    pub fn apply(&self, row: &mut Row) -> Result<()> {
        if let Some(target) = &self.status {
            row.status.check_transition(row.id.as_str(), target)?;
        }

        if let Some(target) = &self.status {
            row.status = target.clone();
        }
        if let Some(at) = self.start_time {
            row.start_time = Some(at);
        }
        if let Some(at) = self.end_time {
            row.end_time = Some(at);
        }
        if let Some(comment) = &self.comment {
            row.comment = (!comment.is_empty()).then(|| comment.clone());
        }
        if let Some(who) = &self.performed_by {
            row.performed_by = Some(who.clone());
        }
        Ok(())
    }
}

/// Formats a timestamp the way it is written into the table.
#[must_use]
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a timestamp cell.
///
/// Accepts RFC 3339 and the `YYYY-MM-DD HH:MM:SS` form (read as UTC). Returns
/// `None` for empty or unrecognised cells.
#[must_use]
pub fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(cell) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
