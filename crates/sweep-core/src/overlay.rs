//! Overlay of global defaults onto a claimed row's parameters.
//!
//! Values are opaque scalars. Table cells arrive as strings, defaults keep the
//! JSON scalar type they were configured with, and nothing is coerced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::row::{Row, RowId};

/// Flat map from key-path to scalar value.
pub type ParameterMap = BTreeMap<String, Value>;

/// Merges `row_parameters` over `defaults`.
///
/// Row keys win; keys only present on one side pass through unchanged.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use sweep_core::overlay::{ParameterMap, merge};
///
/// let defaults: ParameterMap = [("a".into(), json!(1)), ("b".into(), json!(2))].into();
/// let row: ParameterMap = [("b".into(), json!(5)), ("c".into(), json!(9))].into();
///
/// let merged = merge(&defaults, &row);
/// assert_eq!(merged["a"], json!(1));
/// assert_eq!(merged["b"], json!(5));
/// assert_eq!(merged["c"], json!(9));
/// ```
#[must_use]
pub fn merge(defaults: &ParameterMap, row_parameters: &ParameterMap) -> ParameterMap {
    let mut merged = defaults.clone();
    merged.extend(
        row_parameters
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    merged
}

/// Lifts a row's raw cell values into a parameter map.
#[must_use]
pub fn row_parameters(row: &Row) -> ParameterMap {
    row.parameters
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect()
}

/// Parameters handed to a worker for one claimed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// The claimed row.
    pub id: RowId,
    /// Defaults overlaid with the row's own values.
    pub parameters: ParameterMap,
}

impl Claim {
    /// Builds the claim for `row` by overlaying it onto `defaults`.
    #[must_use]
    pub fn from_row(row: &Row, defaults: &ParameterMap) -> Self {
        Self {
            id: row.id.clone(),
            parameters: merge(defaults, &row_parameters(row)),
        }
    }

    /// Looks up a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Looks up a parameter and renders it as text.
    ///
    /// Strings come back verbatim; other scalars use their JSON form.
    #[must_use]
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).map(scalar_text)
    }
}

/// Renders a scalar as plain text (strings unquoted).
#[must_use]
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
