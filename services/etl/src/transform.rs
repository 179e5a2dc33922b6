//! Normalizer - maps a raw homicide batch onto the canonical fact schema
//!
//! - Resolves heterogeneous source column names through a fixed alias table
//! - Coerces dates and counts, counting every coercion instead of failing
//! - Strips diacritics and title-cases categorical text
//!
//! This module is DETERMINISTIC: same batch = same records, same order.

use crate::batch::RawBatch;
use crate::error::{EtlError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::{Map, Value};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const EVENT_DATE: &str = "event_date";
pub const DEPARTMENT_CODE: &str = "department_code";
pub const DEPARTMENT_NAME: &str = "department_name";
pub const MUNICIPALITY_CODE: &str = "municipality_code";
pub const MUNICIPALITY_NAME: &str = "municipality_name";
pub const ZONE: &str = "zone";
pub const SEX: &str = "sex";
pub const COUNT: &str = "count";

/// Canonical fact columns, in storage order.
pub const CANONICAL_COLUMNS: &[&str] = &[
    EVENT_DATE,
    DEPARTMENT_CODE,
    DEPARTMENT_NAME,
    MUNICIPALITY_CODE,
    MUNICIPALITY_NAME,
    ZONE,
    SEX,
    COUNT,
];

/// Alias table keyed by the simplified column name (lowercase, no spaces or
/// underscores). Order is priority: when two source columns alias the same
/// canonical column, the earlier entry claims it.
const FACT_ALIASES: &[(&str, &str)] = &[
    ("eventdate", EVENT_DATE),
    ("fechahecho", EVENT_DATE),
    ("fecha", EVENT_DATE),
    ("departmentcode", DEPARTMENT_CODE),
    ("coddepto", DEPARTMENT_CODE),
    ("coddepartamento", DEPARTMENT_CODE),
    ("codigodepartamento", DEPARTMENT_CODE),
    ("depto", DEPARTMENT_CODE),
    ("departmentname", DEPARTMENT_NAME),
    ("departamento", DEPARTMENT_NAME),
    ("depart", DEPARTMENT_NAME),
    ("municipalitycode", MUNICIPALITY_CODE),
    ("codmuni", MUNICIPALITY_CODE),
    ("codmpio", MUNICIPALITY_CODE),
    ("codigomunicipio", MUNICIPALITY_CODE),
    ("municipalityname", MUNICIPALITY_NAME),
    ("municipio", MUNICIPALITY_NAME),
    ("nombremunicipio", MUNICIPALITY_NAME),
    ("zone", ZONE),
    ("zona", ZONE),
    ("sex", SEX),
    ("sexo", SEX),
    ("count", COUNT),
    ("cantidad", COUNT),
    ("total", COUNT),
];

/// One canonical homicide observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HomicideRecord {
    pub event_date: NaiveDate,
    pub department_code: String,
    pub department_name: String,
    pub municipality_code: String,
    pub municipality_name: String,
    pub zone: String,
    pub sex: String,
    pub count: i64,
    pub source_tag: String,
}

impl HomicideRecord {
    /// Natural key used for upsert conflicts.
    pub fn natural_key(&self) -> (NaiveDate, &str, &str, &str, &str, &str) {
        (
            self.event_date,
            self.department_code.as_str(),
            self.municipality_code.as_str(),
            self.zone.as_str(),
            self.sex.as_str(),
            self.source_tag.as_str(),
        )
    }
}

/// Per-row coercions applied while normalizing. Never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoercionReport {
    /// Rows dropped because `event_date` did not parse.
    pub dropped_bad_dates: usize,
    /// Counts that were missing, malformed or negative and became zero.
    pub zeroed_counts: usize,
}

impl CoercionReport {
    pub fn is_clean(&self) -> bool {
        self.dropped_bad_dates == 0 && self.zeroed_counts == 0
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub records: Vec<HomicideRecord>,
    pub coercions: CoercionReport,
}

/// Lowercase and drop spaces/underscores, the key used for alias lookup.
pub fn simplify_column(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| *c != ' ' && *c != '_')
        .collect()
}

/// Applies `aliases` to the batch in priority order and returns the renames
/// performed as `(source, canonical)` pairs. A rename only happens when the
/// canonical column is not already present.
pub fn resolve_aliases(batch: &mut RawBatch, aliases: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut renamed = Vec::new();
    for (alias, canonical) in aliases {
        if batch.has_column(canonical) {
            continue;
        }
        let source = batch
            .columns()
            .iter()
            .find(|c| simplify_column(c) == *alias)
            .cloned();
        if let Some(source) = source {
            if batch.rename_column(&source, canonical) {
                renamed.push((source, canonical.to_string()));
            }
        }
    }
    renamed
}

/// Returns the canonical columns still absent from the batch.
pub fn missing_columns(batch: &RawBatch, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|c| !batch.has_column(c))
        .map(|c| c.to_string())
        .collect()
}

/// Normalizes a raw homicide batch into canonical records stamped with
/// `source_tag`.
pub fn normalize(mut batch: RawBatch, source_tag: &str) -> Result<NormalizedBatch> {
    let renamed = resolve_aliases(&mut batch, FACT_ALIASES);
    if !renamed.is_empty() {
        tracing::info!(?renamed, "renamed source columns");
    }

    let missing = missing_columns(&batch, CANONICAL_COLUMNS);
    if !missing.is_empty() {
        return Err(EtlError::Schema { missing });
    }

    let mut coercions = CoercionReport::default();
    let mut records = Vec::with_capacity(batch.len());

    for row in batch.rows() {
        let Some(event_date) = row.get(EVENT_DATE).and_then(parse_date) else {
            coercions.dropped_bad_dates += 1;
            continue;
        };

        let count = match row.get(COUNT).and_then(parse_count) {
            Some(count) => count,
            None => {
                coercions.zeroed_counts += 1;
                0
            }
        };

        records.push(HomicideRecord {
            event_date,
            department_code: code_field(row, DEPARTMENT_CODE),
            department_name: normalize_text(&text_field(row, DEPARTMENT_NAME)),
            municipality_code: code_field(row, MUNICIPALITY_CODE),
            municipality_name: normalize_text(&text_field(row, MUNICIPALITY_NAME)),
            zone: normalize_text(&text_field(row, ZONE)),
            sex: normalize_text(&text_field(row, SEX)),
            count,
            source_tag: source_tag.to_string(),
        });
    }

    if !coercions.is_clean() {
        tracing::warn!(
            dropped_bad_dates = coercions.dropped_bad_dates,
            zeroed_counts = coercions.zeroed_counts,
            "coerced malformed values"
        );
    }

    Ok(NormalizedBatch { records, coercions })
}

/// Date formats seen in the API (floating timestamps) and in the CSV
/// snapshots (day-first).
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Non-negative integer count; `None` means the caller substitutes zero.
pub fn parse_count(value: &Value) -> Option<i64> {
    let count = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        }
        _ => None,
    }?;
    (count >= 0).then_some(count)
}

fn text_field(row: &Map<String, Value>, column: &str) -> String {
    match row.get(column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn code_field(row: &Map<String, Value>, column: &str) -> String {
    text_field(row, column).trim().to_string()
}

/// Strips diacritics, trims, lowercases, then uppercases every letter that
/// does not follow another letter. Idempotent.
pub fn normalize_text(input: &str) -> String {
    let stripped: String = input.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    title_case(&stripped.trim().to_lowercase())
}

fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_alpha = false;
    for c in input.chars() {
        if c.is_alphabetic() && !prev_alpha {
            // Multi-char mappings ("ß" -> "SS") title-case as "Ss".
            let mut upper = c.to_uppercase();
            if let Some(first) = upper.next() {
                out.push(first);
            }
            out.extend(upper.flat_map(char::to_lowercase));
        } else {
            out.push(c);
        }
        prev_alpha = c.is_alphabetic();
    }
    out
}

// =============================================================================
// TESTS
// =============================================================================
