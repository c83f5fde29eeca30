//! Storage identifier rules shared by columns and tables.
//!
//! A sanitized identifier matches `[a-z0-9_]+`, never starts with a digit or
//! an underscore, and is at most [`MAX_IDENTIFIER_LEN`] characters long.
//! Leading underscores are reserved for the loader's system columns.

use std::{collections::HashSet, path::Path};

pub const MAX_IDENTIFIER_LEN: usize = 128;
pub const FALLBACK_IDENTIFIER: &str = "unnamed_column";
pub const DIGIT_PREFIX: &str = "col_";

/// Rewrite `raw` into a storage-safe identifier. Idempotent.
pub fn sanitize_identifier(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut cleaned = String::with_capacity(lowered.len());
    let mut in_gap = false;
    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            cleaned.push(ch);
            in_gap = false;
        } else if !in_gap {
            cleaned.push('_');
            in_gap = true;
        }
    }
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        return FALLBACK_IDENTIFIER.to_string();
    }
    let mut name = if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("{DIGIT_PREFIX}{trimmed}")
    } else {
        trimmed.to_string()
    };
    if name.len() > MAX_IDENTIFIER_LEN {
        name.truncate(MAX_IDENTIFIER_LEN);
        let kept = name.trim_end_matches('_').len();
        name.truncate(kept);
    }
    name
}

/// Make every name unique by appending `_2`, `_3`, ... to repeats.
/// The first occurrence keeps its name.
pub fn dedupe(names: &[String]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    let mut result = Vec::with_capacity(names.len());
    for name in names {
        if taken.insert(name.clone()) {
            result.push(name.clone());
            continue;
        }
        let mut suffix = 2usize;
        let unique = loop {
            let tail = format!("_{suffix}");
            let mut base = name.clone();
            base.truncate(MAX_IDENTIFIER_LEN.saturating_sub(tail.len()));
            let candidate = format!("{base}{tail}");
            if !taken.contains(&candidate) {
                break candidate;
            }
            suffix += 1;
        };
        taken.insert(unique.clone());
        result.push(unique);
    }
    result
}

/// Sanitize then dedupe a header row.
pub fn sanitize_columns<S: AsRef<str>>(headers: &[S]) -> Vec<String> {
    let sanitized: Vec<String> = headers
        .iter()
        .map(|header| sanitize_identifier(header.as_ref()))
        .collect();
    dedupe(&sanitized)
}

/// Default destination table for an uploaded file: its stem, sanitized.
pub fn table_name_for(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(filename);
    sanitize_identifier(stem)
}
