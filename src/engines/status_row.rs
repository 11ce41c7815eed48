//! Ordered column -> value snapshot of an introspection result.
//!
//! A [`StatusRow`] holds one row of output from commands like
//! `show slave status`.  Keys are case-sensitive and keep the order the
//! engine returned them in.  Cells are text or NULL; typed getters coerce
//! on read.  Rows are built once and never mutated.

use serde_json::{Map, Value};

/// One cell of a status row.  `None` is SQL `NULL`.
pub type Cell = Option<String>;

/// An immutable, ordered mapping of column name to cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRow {
    columns: Vec<(String, Cell)>,
}

impl StatusRow {
    /// Build a row from `(column, cell)` pairs in engine order.
    pub fn new(columns: Vec<(String, Cell)>) -> Self {
        Self { columns }
    }

    /// Convenience constructor for non-NULL text cells.
    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            columns: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Column names in order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(k, _)| k.as_str())
    }

    /// Raw cell lookup; `None` when the column is absent.
    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.columns
            .iter()
            .find(|(k, _)| k == column)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cell(column).is_some()
    }

    /// Text value of `column`; absent columns and NULL read as `""`.
    pub fn get_string(&self, column: &str) -> &str {
        self.cell(column)
            .and_then(|c| c.as_deref())
            .unwrap_or_default()
    }

    /// Whether `column` is NULL or absent.
    pub fn is_null(&self, column: &str) -> bool {
        !matches!(self.cell(column), Some(Some(_)))
    }

    /// Boolean coercion: `1`, `t`, `true`, `on`, `yes` (case-insensitive).
    pub fn get_bool(&self, column: &str) -> bool {
        parse_bool(self.get_string(column))
    }

    /// Integer coercion; `None` when absent, NULL, or not numeric.
    pub fn get_int(&self, column: &str) -> Option<i64> {
        self.cell(column)
            .and_then(|c| c.as_deref())
            .and_then(|s| s.trim().parse().ok())
    }

    /// Render as a JSON object, NULL cells as `null`.
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.columns.len());
        for (k, v) in &self.columns {
            let value = match v {
                Some(s) => Value::String(s.clone()),
                None => Value::Null,
            };
            map.insert(k.clone(), value);
        }
        Value::Object(map)
    }
}

/// Shared boolean parsing for engine flag values.
pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "on" | "yes"
    )
}

/// Serialize a result set as a JSON array of objects.
pub fn rows_to_json(rows: &[StatusRow]) -> Vec<u8> {
    let array = Value::Array(rows.iter().map(StatusRow::to_json).collect());
    // Serializing a `Value` cannot fail.
    serde_json::to_vec(&array).unwrap_or_default()
}
