//! SQL text encoding for statement-text batching.
//!
//! Every value that is spliced into SQL text goes through [`encode_literal`];
//! every identifier goes through [`quote_identifier`]. Nothing else in the
//! crate builds literals by hand.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    data::{CANONICAL_DATE_FORMAT, CANONICAL_TIMESTAMP_FORMAT, Value},
    schema::ColumnType,
};

pub const DEFAULT_MAX_TEXT_LEN: usize = 10_000;

/// SQL flavour of the destination engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    #[default]
    Sqlite,
    /// Lakehouse engines that treat backslash as an escape inside literals.
    Spark,
}

impl SqlDialect {
    pub fn type_name(&self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (SqlDialect::Sqlite, ColumnType::Integer) => "INTEGER",
            (SqlDialect::Sqlite, ColumnType::Float) => "REAL",
            (SqlDialect::Sqlite, ColumnType::Boolean) => "BOOLEAN",
            (SqlDialect::Sqlite, ColumnType::Timestamp) => "TIMESTAMP",
            (SqlDialect::Sqlite, ColumnType::Date) => "DATE",
            // STRING would get NUMERIC affinity in SQLite.
            (SqlDialect::Sqlite, ColumnType::String) => "TEXT",
            (SqlDialect::Spark, ColumnType::Integer) => "BIGINT",
            (SqlDialect::Spark, ColumnType::Float) => "DOUBLE",
            (SqlDialect::Spark, ColumnType::Boolean) => "BOOLEAN",
            (SqlDialect::Spark, ColumnType::Timestamp) => "TIMESTAMP",
            (SqlDialect::Spark, ColumnType::Date) => "DATE",
            (SqlDialect::Spark, ColumnType::String) => "STRING",
        }
    }

    pub fn escapes_backslash(&self) -> bool {
        matches!(self, SqlDialect::Spark)
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::Spark => "spark",
        })
    }
}

/// Render `value` as a SQL literal. `None` and non-finite floats become `NULL`.
pub fn encode_literal(value: Option<&Value>, dialect: SqlDialect, max_text_len: usize) -> String {
    let Some(value) = value else {
        return "NULL".to_string();
    };
    match value {
        Value::Boolean(true) => "TRUE".to_string(),
        Value::Boolean(false) => "FALSE".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) if !f.is_finite() => "NULL".to_string(),
        // Debug formatting keeps a fraction or exponent, so the literal stays REAL.
        Value::Float(f) => format!("{f:?}"),
        Value::Date(d) => format!("'{}'", d.format(CANONICAL_DATE_FORMAT)),
        Value::Timestamp(ts) => format!("'{}'", ts.format(CANONICAL_TIMESTAMP_FORMAT)),
        Value::String(s) => encode_text(s, dialect, max_text_len),
    }
}

/// Quote, escape and cap a string literal. The cap counts characters, never
/// splitting a code point.
pub fn encode_text(value: &str, dialect: SqlDialect, max_text_len: usize) -> String {
    let capped = cap_text(value, max_text_len);
    let mut out = String::with_capacity(capped.len() + 2);
    out.push('\'');
    for ch in capped.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' if dialect.escapes_backslash() => out.push_str("\\\\"),
            '\0' => {}
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Longest prefix of `value` holding at most `max_chars` characters.
pub fn cap_text(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => &value[..cut],
        None => value,
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `("a", "b", ...)` column list for INSERT statements.
pub fn column_list(columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    format!("({})", quoted.join(", "))
}
