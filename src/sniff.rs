//! Format sniffing: extension dispatch, encoding and delimiter detection, and
//! the CSV, JSON and spreadsheet decoders that produce a [`RawFrame`].

use std::{fmt, io::Cursor, path::Path};

use calamine::{Data, Reader, open_workbook_auto_from_rs};
use log::{debug, info, warn};

use crate::{
    config::PipelineConfig,
    data::{CANONICAL_DATE_FORMAT, CANONICAL_TIMESTAMP_FORMAT, RawCell},
    error::{IngestError, Result},
    frame::RawFrame,
    io_utils::{self, DetectedEncoding},
};

/// Candidate delimiters in tie-break priority order.
pub const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Label recorded for formats that carry no text encoding.
pub const BINARY_ENCODING_LABEL: &str = "binary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
    Spreadsheet,
}

impl FileFormat {
    pub fn from_filename(filename: &str) -> Result<Self> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(FileFormat::Csv),
            "json" => Ok(FileFormat::Json),
            "xlsx" | "xls" => Ok(FileFormat::Spreadsheet),
            _ => Err(IngestError::UnsupportedFormat { extension }),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
            FileFormat::Spreadsheet => "spreadsheet",
        })
    }
}

/// Non-fatal problems found while decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SniffIssues {
    pub skipped_rows: usize,
    pub notes: Vec<String>,
}

impl SniffIssues {
    fn skip(&mut self, note: String) {
        self.skipped_rows += 1;
        self.notes.push(note);
    }

    pub fn is_empty(&self) -> bool {
        self.skipped_rows == 0 && self.notes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SniffOutcome {
    pub format: FileFormat,
    pub frame: RawFrame,
    /// `None` for spreadsheets, which are not byte-encoded text.
    pub encoding: Option<DetectedEncoding>,
    pub delimiter: Option<u8>,
    pub issues: SniffIssues,
}

impl SniffOutcome {
    pub fn encoding_label(&self) -> String {
        self.encoding
            .as_ref()
            .map(|detected| detected.label.clone())
            .unwrap_or_else(|| BINARY_ENCODING_LABEL.to_string())
    }
}

/// Decode `bytes` into a frame, detecting everything the filename does not say.
pub fn sniff(bytes: &[u8], filename: &str, config: &PipelineConfig) -> Result<SniffOutcome> {
    let format = FileFormat::from_filename(filename)?;
    if bytes.is_empty() {
        return Err(IngestError::EmptyFile(filename.to_string()));
    }

    let outcome = match format {
        FileFormat::Spreadsheet => {
            let (frame, issues) = decode_spreadsheet(bytes)?;
            SniffOutcome {
                format,
                frame,
                encoding: None,
                delimiter: None,
                issues,
            }
        }
        FileFormat::Csv | FileFormat::Json => {
            let sample_len = bytes.len().min(config.encoding_sample_bytes);
            let detected = io_utils::detect_encoding(
                &bytes[..sample_len],
                config.encoding_confidence_threshold,
                sample_len < bytes.len(),
            );
            debug!(
                "Encoding guess for '{filename}': {} (confidence {:.2}, probed {})",
                detected.label, detected.confidence, detected.probed
            );
            let decoded = io_utils::decode_full(bytes, detected);
            let detected = decoded.encoding;
            let text = decoded.text;
            let mut issues = SniffIssues::default();
            if let Some(guess) = decoded.redetected_from {
                warn!("'{filename}' is not valid {guess} past the sample; decoded as {}", detected.label);
                issues.notes.push(format!(
                    "bytes past the {} byte sample are not {guess}; decoded as {}",
                    config.encoding_sample_bytes, detected.label
                ));
            }
            if decoded.had_errors {
                issues.notes.push(format!(
                    "bytes outside {} were replaced during decoding",
                    detected.label
                ));
            }
            let (frame, delimiter) = if format == FileFormat::Csv {
                let delimiter = detect_delimiter(&text, config.delimiter_sample_lines);
                (decode_csv(&text, delimiter, &mut issues)?, Some(delimiter))
            } else {
                (decode_json(&text, &mut issues)?, None)
            };
            SniffOutcome {
                format,
                frame,
                encoding: Some(detected),
                delimiter,
                issues,
            }
        }
    };

    info!(
        "Sniffed '{filename}' as {} ({} column(s), {} row(s), {} skipped)",
        outcome.format,
        outcome.frame.column_count(),
        outcome.frame.row_count(),
        outcome.issues.skipped_rows
    );
    Ok(outcome)
}

/// Pick the candidate delimiter occurring most often in the first `lines`
/// lines. Ties go to the earlier candidate; text with none yields `,`.
pub fn detect_delimiter(text: &str, lines: usize) -> u8 {
    let mut counts = [0usize; CANDIDATE_DELIMITERS.len()];
    for line in text.lines().take(lines) {
        for byte in line.bytes() {
            if let Some(pos) = CANDIDATE_DELIMITERS.iter().position(|d| *d == byte) {
                counts[pos] += 1;
            }
        }
    }
    let mut best = 0usize;
    for (pos, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = pos;
        }
    }
    CANDIDATE_DELIMITERS[best]
}

fn decode_csv(text: &str, delimiter: u8, issues: &mut SniffIssues) -> Result<RawFrame> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = io_utils::open_csv_reader(text, delimiter);
    let mut records = reader.records();

    let header = loop {
        match records.next() {
            Some(Ok(record)) => break record,
            Some(Err(err)) => issues.skip(format!("unreadable header candidate: {err}")),
            None => return Err(IngestError::Decode("no header row found".to_string())),
        }
    };
    let columns: Vec<String> = header.iter().map(|field| field.trim().to_string()).collect();
    let mut frame = RawFrame::new(columns);

    for (idx, record) in records.enumerate() {
        let line = idx + 2;
        match record {
            Ok(record) => {
                let cells = record
                    .iter()
                    .map(|field| RawCell::Text(field.to_string()))
                    .collect();
                if !frame.push_row(cells) {
                    issues.skip(format!(
                        "record {line} has {} field(s), expected {}",
                        record.len(),
                        frame.column_count()
                    ));
                }
            }
            Err(err) => issues.skip(format!("record {line} could not be parsed: {err}")),
        }
    }
    Ok(frame)
}

fn decode_json(text: &str, issues: &mut SniffIssues) -> Result<RawFrame> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let document: serde_json::Value =
        serde_json::from_str(text).map_err(|err| IngestError::Decode(err.to_string()))?;
    let records = match document {
        serde_json::Value::Array(items) => items,
        // Exports often wrap the records in a single top-level field.
        serde_json::Value::Object(map) => map
            .into_iter()
            .find_map(|(_, value)| match value {
                serde_json::Value::Array(items) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                IngestError::Decode("JSON object holds no array of records".to_string())
            })?,
        _ => {
            return Err(IngestError::Decode(
                "JSON input must be an array of objects".to_string(),
            ));
        }
    };

    let mut columns: Vec<String> = Vec::new();
    let mut objects = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        match record {
            serde_json::Value::Object(map) => {
                for key in map.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
                objects.push(map);
            }
            other => issues.skip(format!("element {idx} is not an object: {other}")),
        }
    }

    let mut frame = RawFrame::new(columns.clone());
    for mut map in objects {
        let cells = columns
            .iter()
            .map(|column| json_cell(map.remove(column)))
            .collect();
        frame.push_row(cells);
    }
    Ok(frame)
}

fn json_cell(value: Option<serde_json::Value>) -> RawCell {
    match value {
        None | Some(serde_json::Value::Null) => RawCell::Null,
        Some(serde_json::Value::Bool(b)) => RawCell::Boolean(b),
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) => RawCell::Integer(i),
            None => n.as_f64().map(RawCell::Float).unwrap_or(RawCell::Null),
        },
        Some(serde_json::Value::String(s)) => RawCell::Text(s),
        Some(nested) => RawCell::Text(nested.to_string()),
    }
}

fn decode_spreadsheet(bytes: &[u8]) -> Result<(RawFrame, SniffIssues)> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|err| IngestError::Decode(format!("unreadable workbook: {err}")))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| IngestError::Decode("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|err| IngestError::Decode(format!("sheet '{sheet}': {err}")))?;

    let mut issues = SniffIssues::default();
    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| IngestError::Decode(format!("sheet '{sheet}' is empty")))?;
    let columns = header
        .iter()
        .map(|cell| match cell {
            Data::Empty => String::new(),
            other => other.to_string().trim().to_string(),
        })
        .collect();
    let mut frame = RawFrame::new(columns);

    for (idx, row) in rows.enumerate() {
        if row.iter().all(|cell| matches!(cell, Data::Empty)) {
            continue;
        }
        let mut error_cells = 0usize;
        let cells = row
            .iter()
            .map(|cell| {
                let converted = spreadsheet_cell(cell);
                if matches!(cell, Data::Error(_)) {
                    error_cells += 1;
                }
                converted
            })
            .collect();
        if error_cells > 0 {
            issues.notes.push(format!(
                "row {} has {error_cells} error cell(s) read as null",
                idx + 2
            ));
        }
        if !frame.push_row(cells) {
            issues.skip(format!("row {} does not match the header width", idx + 2));
        }
    }
    Ok((frame, issues))
}

fn spreadsheet_cell(cell: &Data) -> RawCell {
    match cell {
        Data::Empty | Data::Error(_) => RawCell::Null,
        Data::String(s) => RawCell::Text(s.clone()),
        Data::Int(i) => RawCell::Integer(*i),
        Data::Float(f) => RawCell::Float(*f),
        Data::Bool(b) => RawCell::Boolean(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) if ts.time() == chrono::NaiveTime::MIN => {
                RawCell::Text(ts.format(CANONICAL_DATE_FORMAT).to_string())
            }
            Some(ts) => RawCell::Text(ts.format(CANONICAL_TIMESTAMP_FORMAT).to_string()),
            None => RawCell::Float(dt.as_f64()),
        },
        other => RawCell::Text(other.to_string()),
    }
}
