//! Column type inference, typed-row conversion, and schema persistence.
//!
//! Inference samples up to `sample_size` non-null values per column and picks
//! the narrowest type every sample satisfies, in the order Integer, Float,
//! Boolean, Date/Timestamp, String. A full pass over the frame then settles
//! nullability and widens any column whose unsampled values would not fit
//! (Integer to Float, anything else to String) so no value is dropped.
//! Columns holding integers beyond 2^53 go to String rather than Float.

use std::{collections::HashSet, fmt, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result, anyhow};
use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    data::{
        RawCell, Value, parse_boolean, parse_finite_float, parse_naive_date, parse_naive_datetime,
        type_cell,
    },
    frame::{RawFrame, TypedFrame},
    naming,
};

pub const CURRENT_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    String,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
            ColumnType::String => "string",
        }
    }

    /// Next type that accepts every value this one accepts.
    pub fn widen(self) -> ColumnType {
        match self {
            ColumnType::Integer => ColumnType::Float,
            _ => ColumnType::String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub source_name: String,
    pub sanitized_name: String,
    pub inferred_type: ColumnType,
    pub nullable: bool,
    pub sample_size: usize,
}

/// Advisory statistics surfaced to the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameProfile {
    pub row_count: usize,
    pub duplicate_rows: usize,
    pub null_percentages: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferredSchema {
    pub columns: Vec<ColumnSchema>,
    pub profile: FrameProfile,
    /// Human-readable notes such as type widening; never fatal.
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct TypeCandidate {
    sampled: usize,
    integer_matches: usize,
    float_matches: usize,
    boolean_matches: usize,
    date_matches: usize,
    datetime_matches: usize,
}

impl TypeCandidate {
    fn update(&mut self, value: &str) {
        self.sampled += 1;
        // Zero-padded codes such as "007" keep their text.
        if has_leading_zero(value) {
            if parse_boolean(value).is_some() {
                self.boolean_matches += 1;
            }
            return;
        }
        if value.parse::<i64>().is_ok() {
            self.integer_matches += 1;
        }
        if parse_finite_float(value).is_some() {
            self.float_matches += 1;
        }
        if parse_boolean(value).is_some() {
            self.boolean_matches += 1;
        }
        if parse_naive_date(value).is_ok() {
            self.date_matches += 1;
        } else if parse_naive_datetime(value).is_ok() {
            self.datetime_matches += 1;
        }
    }

    fn decide(&self) -> ColumnType {
        let all = |matches: usize| self.sampled > 0 && matches == self.sampled;
        if all(self.integer_matches) {
            ColumnType::Integer
        } else if all(self.float_matches) {
            ColumnType::Float
        } else if all(self.boolean_matches) {
            ColumnType::Boolean
        } else if all(self.date_matches + self.datetime_matches) {
            if self.datetime_matches > 0 {
                ColumnType::Timestamp
            } else {
                ColumnType::Date
            }
        } else {
            ColumnType::String
        }
    }
}

fn has_leading_zero(value: &str) -> bool {
    let digits = value.strip_prefix(['-', '+']).unwrap_or(value);
    let mut chars = digits.chars();
    matches!(chars.next(), Some('0')) && matches!(chars.next(), Some(c) if c.is_ascii_digit())
}

/// Infer one [`ColumnSchema`] per frame column. Never fails; columns with
/// no usable samples default to `String`.
pub fn infer(frame: &RawFrame, sample_size: usize) -> InferredSchema {
    let sanitized = naming::sanitize_columns(frame.columns());
    let mut columns = Vec::with_capacity(frame.column_count());
    let mut issues = Vec::new();

    for (idx, (source, name)) in frame.columns().iter().zip(sanitized).enumerate() {
        let mut candidate = TypeCandidate::default();
        for text in frame
            .column_cells(idx)
            .filter_map(RawCell::probe_text)
            .take(sample_size)
        {
            candidate.update(&text);
        }
        let sampled_type = candidate.decide();
        let (settled, nullable) = settle_column(frame, idx, sampled_type);
        if settled != sampled_type {
            issues.push(format!(
                "column '{name}' widened from {sampled_type} to {settled} to fit unsampled values"
            ));
        }
        columns.push(ColumnSchema {
            source_name: source.clone(),
            sanitized_name: name,
            inferred_type: settled,
            nullable,
            sample_size: candidate.sampled,
        });
    }

    let profile = profile_frame(frame, &columns);
    if profile.duplicate_rows > 0 {
        issues.push(format!("{} duplicate row(s) detected", profile.duplicate_rows));
    }
    InferredSchema {
        columns,
        profile,
        issues,
    }
}

/// Scan every row of a column, widening the type until all values convert.
fn settle_column(frame: &RawFrame, idx: usize, initial: ColumnType) -> (ColumnType, bool) {
    let mut ty = if initial == ColumnType::Float && holds_inexact_integers(frame, idx) {
        ColumnType::String
    } else {
        initial
    };
    let mut nullable = false;
    for cell in frame.column_cells(idx) {
        if cell.is_missing() {
            nullable = true;
            continue;
        }
        while ty != ColumnType::String && type_cell(cell, ty).is_err() {
            ty = widen_column(frame, idx, ty);
        }
    }
    (ty, nullable)
}

/// Largest integer magnitude an f64 holds exactly.
const MAX_EXACT_FLOAT_INT: u128 = 1 << 53;

/// [`ColumnType::widen`], skipping Float when it would round integers.
fn widen_column(frame: &RawFrame, idx: usize, ty: ColumnType) -> ColumnType {
    match ty.widen() {
        ColumnType::Float if holds_inexact_integers(frame, idx) => ColumnType::String,
        widened => widened,
    }
}

fn holds_inexact_integers(frame: &RawFrame, idx: usize) -> bool {
    frame.column_cells(idx).any(|cell| match cell {
        RawCell::Integer(i) => u128::from(i.unsigned_abs()) > MAX_EXACT_FLOAT_INT,
        RawCell::Text(text) => {
            let digits = text.trim().trim_start_matches(['+', '-']);
            !digits.is_empty()
                && digits.bytes().all(|b| b.is_ascii_digit())
                && digits.parse::<u128>().map_or(true, |value| value > MAX_EXACT_FLOAT_INT)
        }
        _ => false,
    })
}

fn cell_key(cell: &RawCell) -> String {
    match cell {
        RawCell::Null => "\u{0}".to_string(),
        RawCell::Text(s) => format!("t{s}"),
        RawCell::Integer(i) => format!("i{i}"),
        RawCell::Float(f) => format!("f{}", f.to_bits()),
        RawCell::Boolean(b) => format!("b{b}"),
    }
}

fn profile_frame(frame: &RawFrame, columns: &[ColumnSchema]) -> FrameProfile {
    let row_count = frame.row_count();
    let mut seen: HashSet<String> = HashSet::with_capacity(row_count);
    let mut duplicate_rows = 0usize;
    for row in frame.rows() {
        let key = row.iter().map(cell_key).join("\u{1f}");
        if !seen.insert(key) {
            duplicate_rows += 1;
        }
    }
    let null_percentages = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let nulls = frame.column_cells(idx).filter(|cell| cell.is_missing()).count();
            let pct = if row_count == 0 {
                0.0
            } else {
                nulls as f64 * 100.0 / row_count as f64
            };
            (column.sanitized_name.clone(), pct)
        })
        .collect();
    FrameProfile {
        row_count,
        duplicate_rows,
        null_percentages,
    }
}

/// Convert every row to `schema`. A column whose values do not all convert
/// is widened and converted again, so the result always holds every value.
pub fn type_rows(frame: &RawFrame, mut schema: Vec<ColumnSchema>) -> TypedFrame {
    let mut rows: Vec<Vec<Option<Value>>> = (0..frame.row_count())
        .map(|_| Vec::with_capacity(schema.len()))
        .collect();
    for (idx, column) in schema.iter_mut().enumerate() {
        let values = loop {
            match convert_column(frame, idx, column.inferred_type) {
                Ok(values) => break values,
                Err(reason) => {
                    let widened = widen_column(frame, idx, column.inferred_type);
                    warn!(
                        "Column '{}' does not fit {} ({reason}); widening to {widened}",
                        column.sanitized_name, column.inferred_type
                    );
                    column.inferred_type = widened;
                }
            }
        };
        if values.iter().any(Option::is_none) {
            column.nullable = true;
        }
        for (row, value) in rows.iter_mut().zip(values) {
            row.push(value);
        }
    }
    TypedFrame { schema, rows }
}

fn convert_column(
    frame: &RawFrame,
    idx: usize,
    ty: ColumnType,
) -> std::result::Result<Vec<Option<Value>>, String> {
    frame
        .column_cells(idx)
        .map(|cell| type_cell(cell, ty).map_err(|err| err.to_string()))
        .collect()
}

/// Persisted form of an inferred schema, editable by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(table_name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            schema_version: Some(CURRENT_SCHEMA_VERSION.to_string()),
            table_name: table_name.into(),
            columns,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating schema file {path:?}"))?;
        serde_yaml::to_writer(file, self).context("Writing schema YAML")
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing schema to YAML string")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let reader = BufReader::new(file);
        let schema: TableSchema = serde_yaml::from_reader(reader).context("Parsing schema YAML")?;
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if naming::sanitize_identifier(&column.sanitized_name) != column.sanitized_name {
                return Err(anyhow!(
                    "Column '{}' is not a valid storage identifier",
                    column.sanitized_name
                ));
            }
            if !seen.insert(column.sanitized_name.as_str()) {
                return Err(anyhow!("Duplicate column '{}'", column.sanitized_name));
            }
        }
        Ok(())
    }
}
