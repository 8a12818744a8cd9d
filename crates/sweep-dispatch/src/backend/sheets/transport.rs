//! Network seam for the spreadsheet backend.

use async_trait::async_trait;

use crate::retry::TransportError;

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A single cell write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    /// 1-based sheet row (row 1 is the header).
    pub row: usize,
    /// 0-based column index.
    pub column: usize,
    /// Raw value to write.
    pub value: String,
}

impl CellUpdate {
    /// Returns the cell address in A1 notation.
    #[must_use]
    pub fn a1(&self) -> String {
        format!("{}{}", column_letter(self.column + 1), self.row)
    }
}

/// Raw access to one spreadsheet.
///
/// Implementations classify their failures as transient or fatal and leave
/// retrying to the caller.
#[async_trait]
pub trait SheetTransport: Send + Sync + 'static {
    /// Lists worksheet titles in display order.
    async fn worksheets(&self) -> TransportResult<Vec<String>>;

    /// Reads every populated row of a worksheet, header first.
    ///
    /// Trailing empty cells and rows may be omitted.
    async fn read_values(&self, worksheet: &str) -> TransportResult<Vec<Vec<String>>>;

    /// Writes a batch of cells in one request.
    async fn write_cells(&self, worksheet: &str, cells: &[CellUpdate]) -> TransportResult<()>;
}

/// Converts a 1-based column number to its letter form (`1` → `A`, `27` → `AA`).
#[must_use]
pub fn column_letter(mut column: usize) -> String {
    let mut letters = Vec::new();
    while column > 0 {
        let remainder = (column - 1) % 26;
        letters.push(char::from(b'A' + u8::try_from(remainder).unwrap_or(0)));
        column = (column - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Quotes a worksheet title for use in a range.
#[must_use]
pub fn quote_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}
