use std::{borrow::Cow, fmt};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Tokens that count as a missing value regardless of column type.
const NULL_SENTINELS: &[&str] = &["", "null", "na", "n/a", "nan"];

/// An untyped cell exactly as a decoder produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawCell {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl RawCell {
    /// Text form used for type probing; `None` for null or sentinel values.
    pub fn probe_text(&self) -> Option<Cow<'_, str>> {
        match self {
            RawCell::Null => None,
            RawCell::Text(s) => {
                let trimmed = s.trim();
                if is_null_token(trimmed) {
                    None
                } else {
                    Some(Cow::Borrowed(trimmed))
                }
            }
            RawCell::Integer(i) => Some(Cow::Owned(i.to_string())),
            RawCell::Float(f) if f.is_nan() => None,
            RawCell::Float(f) => Some(Cow::Owned(f.to_string())),
            RawCell::Boolean(b) => Some(Cow::Owned(b.to_string())),
        }
    }

    pub fn is_missing(&self) -> bool {
        self.probe_text().is_none()
    }
}

pub fn is_null_token(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    NULL_SENTINELS.contains(&lowered.as_str())
}

/// A cell after schema inference decided its column type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.format(CANONICAL_DATE_FORMAT).to_string(),
            Value::Timestamp(ts) => ts.format(CANONICAL_TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// JSON form used in staging artifacts and raw samples.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Date(_) | Value::Timestamp(_) => serde_json::Value::String(self.as_display()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

pub fn parse_naive_date(value: &str) -> Result<NaiveDate> {
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.naive_utc());
    }
    Err(anyhow!("Failed to parse '{value}' as timestamp"))
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_finite_float(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|f| f.is_finite())
}

pub fn parse_typed_value(value: &str, ty: ColumnType) -> Result<Option<Value>> {
    if is_null_token(value) {
        return Ok(None);
    }
    let parsed = match ty {
        ColumnType::String => Value::String(value.to_string()),
        ColumnType::Integer => {
            let parsed: i64 = value
                .trim()
                .parse()
                .with_context(|| format!("Failed to parse '{value}' as integer"))?;
            Value::Integer(parsed)
        }
        ColumnType::Float => {
            let Some(parsed) = parse_finite_float(value.trim()) else {
                bail!("Failed to parse '{value}' as float");
            };
            Value::Float(parsed)
        }
        ColumnType::Boolean => {
            let Some(parsed) = parse_boolean(value) else {
                bail!("Failed to parse '{value}' as boolean");
            };
            Value::Boolean(parsed)
        }
        ColumnType::Date => Value::Date(parse_naive_date(value.trim())?),
        ColumnType::Timestamp => {
            let trimmed = value.trim();
            let parsed = match parse_naive_datetime(trimmed) {
                Ok(ts) => ts,
                Err(_) => parse_naive_date(trimmed)?.and_time(chrono::NaiveTime::MIN),
            };
            Value::Timestamp(parsed)
        }
    };
    Ok(Some(parsed))
}

/// Convert a raw cell into the column's type. Strings keep their original,
/// untrimmed text.
pub fn type_cell(cell: &RawCell, ty: ColumnType) -> Result<Option<Value>> {
    match (cell, ty) {
        (RawCell::Null, _) => Ok(None),
        (RawCell::Text(s), ColumnType::String) => {
            if is_null_token(s) {
                Ok(None)
            } else {
                Ok(Some(Value::String(s.clone())))
            }
        }
        (RawCell::Integer(i), ColumnType::Integer) => Ok(Some(Value::Integer(*i))),
        (RawCell::Integer(i), ColumnType::Float) => Ok(Some(Value::Float(*i as f64))),
        (RawCell::Float(f), ColumnType::Float) if f.is_nan() => Ok(None),
        (RawCell::Float(f), ColumnType::Float) => Ok(Some(Value::Float(*f))),
        (RawCell::Boolean(b), ColumnType::Boolean) => Ok(Some(Value::Boolean(*b))),
        (other, ty) => match other.probe_text() {
            Some(text) => parse_typed_value(&text, ty),
            None => Ok(None),
        },
    }
}
