//! Warehouse boundary for hypolab.
//!
//! The pipeline only ever talks to a [`Warehouse`]: something that runs a
//! read-only SQL statement and returns a typed [`ResultSet`]. The production
//! implementation is [`BigQueryClient`]; tests plug in scripted fakes.

use async_trait::async_trait;
use serde::Serialize;

pub mod bigquery;
pub mod preflight;
pub mod schema;

pub use bigquery::{BigQueryClient, BigQueryConfig, TokenSource};
pub use preflight::{preflight, PreflightError, MIN_SQL_CHARS};
pub use schema::{explore, extract_schema, DataExploration, SchemaField, TableSchema};

/// Executes read-only SQL against an analytical store.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, sql: &str) -> Result<ResultSet, WarehouseError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("warehouse authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("query did not finish within {0}s")]
    Timeout(u64),
    /// The warehouse rejected the statement (syntax, unknown column, ...).
    #[error("query failed: {0}")]
    Query(String),
    #[error("warehouse API error: {0}")]
    Api(String),
    #[error("invalid warehouse response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Config(#[from] hypolab_config::ConfigError),
}

// ============================================================================
// Result sets
// ============================================================================

/// A single typed value. Repeated and record values stay as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl Cell {
    /// Numeric view of the cell. Numeric text (BigQuery NUMERIC, counts
    /// returned as strings) parses; everything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Null => f.write_str("NULL"),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(s) => f.write_str(s),
            Cell::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Bool(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Text(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Cell>>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    /// Untyped columns; convenient for fakes and tests.
    pub fn from_rows<S: AsRef<str>>(names: &[S], rows: Vec<Vec<Cell>>) -> Self {
        let columns = names
            .iter()
            .map(|n| Column {
                name: n.as_ref().to_string(),
                data_type: "STRING".to_string(),
            })
            .collect();
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Numeric values of a column, skipping nulls and non-numeric cells.
    pub fn numeric_column(&self, name: &str) -> Vec<f64> {
        let Some(idx) = self.column_index(name) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|r| r.get(idx).and_then(Cell::as_f64))
            .collect()
    }

    /// Columns where every non-null cell is numeric and at least one exists.
    pub fn numeric_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| {
                let mut seen = false;
                for row in &self.rows {
                    match row.get(*idx) {
                        Some(Cell::Null) | None => {}
                        Some(cell) if cell.as_f64().is_some() => seen = true,
                        Some(_) => return false,
                    }
                }
                seen
            })
            .map(|(_, c)| c.name.as_str())
            .collect()
    }

    /// Markdown table of at most `max_rows` rows.
    pub fn to_text_table(&self, max_rows: usize) -> String {
        if self.columns.is_empty() {
            return "(no columns)\n".to_string();
        }
        let mut out = String::new();
        out.push_str("| ");
        out.push_str(&self.column_names().join(" | "));
        out.push_str(" |\n|");
        for _ in &self.columns {
            out.push_str("---|");
        }
        out.push('\n');
        for row in self.rows.iter().take(max_rows) {
            let cells: Vec<String> = row
                .iter()
                .map(|c| c.to_string().replace('|', "\\|").replace('\n', " "))
                .collect();
            out.push_str("| ");
            out.push_str(&cells.join(" | "));
            out.push_str(" |\n");
        }
        if self.rows.len() > max_rows {
            out.push_str(&format!("\n({} more rows)\n", self.rows.len() - max_rows));
        }
        out
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, cell)| {
                        let value = serde_json::to_value(cell).unwrap_or(serde_json::Value::Null);
                        (col.name.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet::from_rows(
            &["device", "users", "rate"],
            vec![
                vec!["desktop".into(), 120i64.into(), 0.031f64.into()],
                vec!["mobile".into(), Cell::Text("95".into()), Cell::Null],
            ],
        )
    }

    #[test]
    fn numeric_column_parses_text_and_skips_nulls() {
        let rs = sample();
        assert_eq!(rs.numeric_column("USERS"), vec![120.0, 95.0]);
        assert_eq!(rs.numeric_column("rate"), vec![0.031]);
        assert!(rs.numeric_column("missing").is_empty());
    }

    #[test]
    fn numeric_column_names_excludes_text() {
        assert_eq!(sample().numeric_column_names(), vec!["users", "rate"]);
    }

    #[test]
    fn text_table_truncates() {
        let table = sample().to_text_table(1);
        assert!(table.starts_with("| device | users | rate |"));
        assert!(table.contains("| desktop | 120 | 0.031 |"));
        assert!(table.contains("(1 more rows)"));
        assert!(!table.contains("mobile"));
    }

    #[test]
    fn json_rows_are_keyed_by_column() {
        let rows = sample().to_json_rows();
        assert_eq!(rows[0]["users"], serde_json::json!(120));
        assert_eq!(rows[1]["rate"], serde_json::Value::Null);
    }
}
