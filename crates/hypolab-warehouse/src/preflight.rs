//! Cheap checks run on generated SQL before it reaches the warehouse.

use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;

/// Statements shorter than this are treated as truncated model output.
pub const MIN_SQL_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    #[error("generated SQL is too short ({len} chars, need at least {MIN_SQL_CHARS})")]
    TooShort { len: usize },
    #[error("generated SQL must start with SELECT or WITH")]
    NotAQuery,
    #[error("SQL parse error: {0}")]
    Parse(String),
}

/// Text after any leading comments and opening parentheses.
fn statement_body(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if rest.starts_with("--") || rest.starts_with('#') {
            rest = rest.find('\n').map_or("", |end| &rest[end + 1..]);
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.find("*/").map_or("", |end| &comment[end + 2..]);
        } else if let Some(inner) = rest.strip_prefix('(') {
            rest = inner;
        } else {
            return rest;
        }
        rest = rest.trim_start();
    }
}

/// Validate a candidate statement.
///
/// With `parse` set, the statement must also be a single query accepted by
/// the BigQuery dialect.
pub fn preflight(sql: &str, parse: bool) -> Result<(), PreflightError> {
    let trimmed = sql.trim();
    let len = trimmed.chars().count();
    if len < MIN_SQL_CHARS {
        return Err(PreflightError::TooShort { len });
    }

    let head: String = statement_body(trimmed)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    if head != "SELECT" && head != "WITH" {
        return Err(PreflightError::NotAQuery);
    }

    if parse {
        let statements = Parser::parse_sql(&BigQueryDialect {}, trimmed)
            .map_err(|e| PreflightError::Parse(e.to_string()))?;
        if statements.len() != 1 {
            return Err(PreflightError::Parse(format!(
                "expected one statement, found {}",
                statements.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_sql() {
        assert_eq!(preflight("SELECT 1", false), Err(PreflightError::TooShort { len: 8 }));
    }

    #[test]
    fn requires_select_or_with() {
        let err = preflight("DELETE FROM dataset.events WHERE true", false).unwrap_err();
        assert_eq!(err, PreflightError::NotAQuery);
        assert!(preflight("  with a as (select 1 as x) select x from a", false).is_ok());
        assert_eq!(
            preflight("SELECTED_VALUES FROM somewhere_else", false),
            Err(PreflightError::NotAQuery)
        );
    }

    #[test]
    fn skips_leading_comments_and_parentheses() {
        let union = "(SELECT 'control' AS group_type) UNION ALL (SELECT 'treatment')";
        assert_eq!(preflight(union, false), Ok(()));
        let commented = "-- conversion by device\n/* H001 */ SELECT device.category FROM t";
        assert_eq!(preflight(commented, false), Ok(()));
        assert_eq!(
            preflight("-- only a comment, no statement at all", false),
            Err(PreflightError::NotAQuery)
        );
    }

    #[test]
    fn parse_catches_broken_syntax() {
        let broken = "SELECT event_name, COUNT( FROM t GROUP BY";
        assert!(preflight(broken, false).is_ok());
        assert!(matches!(preflight(broken, true), Err(PreflightError::Parse(_))));
    }

    #[test]
    fn parse_accepts_bigquery_query() {
        let sql = "SELECT event_name, COUNT(*) AS n FROM `p.d.events_*` \
                   WHERE _TABLE_SUFFIX BETWEEN '20201101' AND '20210131' GROUP BY event_name";
        assert_eq!(preflight(sql, true), Ok(()));
    }
}
