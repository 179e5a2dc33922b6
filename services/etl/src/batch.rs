//! In-memory tabular batch as fetched from a source, before normalization.

use crate::error::Result;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::Read;

/// Rows keyed by source column name, plus the ordered column set.
///
/// Socrata omits null fields from JSON records, so the column set is the
/// union of keys in first-seen order rather than the keys of any one row.
#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
    content_hash: Option<String>,
}

impl RawBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a batch from JSON records; non-object records are ignored.
    pub fn from_records(records: Vec<Value>) -> Self {
        let mut batch = Self::new();
        batch.extend(records);
        batch
    }

    /// Appends a page of JSON records.
    pub fn extend(&mut self, records: Vec<Value>) {
        for record in records {
            if let Value::Object(map) = record {
                for key in map.keys() {
                    if !self.columns.iter().any(|c| c == key) {
                        self.columns.push(key.clone());
                    }
                }
                self.rows.push(map);
            }
        }
    }

    /// Reads a CSV snapshot; the header row becomes the column set and every
    /// cell is kept as a string.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut row = Map::new();
            for (header, cell) in headers.iter().zip(record.iter()) {
                row.insert(header.clone(), Value::String(cell.to_string()));
            }
            rows.push(row);
        }

        Ok(Self {
            columns: headers,
            rows,
            content_hash: None,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Map<String, Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Renames a column in the header and in every row. Returns `false`
    /// without touching anything when `from` is absent or `to` already exists.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        if self.has_column(to) {
            return false;
        }
        let Some(slot) = self.columns.iter_mut().find(|c| c.as_str() == from) else {
            return false;
        };
        *slot = to.to_string();
        for row in &mut self.rows {
            if let Some(value) = row.remove(from) {
                row.insert(to.to_string(), value);
            }
        }
        true
    }

    /// SHA-256 of the raw payload, when the source recorded one.
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn with_content_hash(mut self, hash: String) -> Self {
        self.content_hash = Some(hash);
        self
    }
}

/// Incremental SHA-256 over the pages of one fetch.
#[derive(Default)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> String {
        format!("sha256:{:x}", self.0.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_columns_are_union_in_first_seen_order() {
        let batch = RawBatch::from_records(vec![
            json!({"fecha_hecho": "2024-01-01", "cantidad": "1"}),
            json!({"fecha_hecho": "2024-01-02", "zona": "URBANA"}),
        ]);
        assert_eq!(batch.columns(), ["cantidad", "fecha_hecho", "zona"]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_non_object_records_ignored() {
        let batch = RawBatch::from_records(vec![json!([1, 2]), json!("x"), json!({"a": 1})]);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_rename_column_moves_values() {
        let mut batch = RawBatch::from_records(vec![json!({"Fecha Hecho": "2024-01-01"})]);
        assert!(batch.rename_column("Fecha Hecho", "event_date"));
        assert!(batch.has_column("event_date"));
        assert!(!batch.has_column("Fecha Hecho"));
        assert_eq!(batch.rows()[0]["event_date"], "2024-01-01");
    }

    #[test]
    fn test_rename_refuses_to_clobber() {
        let mut batch = RawBatch::from_records(vec![json!({"a": 1, "b": 2})]);
        assert!(!batch.rename_column("a", "b"));
        assert_eq!(batch.rows()[0]["b"], 2);
    }

    #[test]
    fn test_from_csv_reader_strips_bom() {
        let csv = "\u{feff}FECHA HECHO,CANTIDAD\n01/01/2024, 2 \n";
        let batch = RawBatch::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(batch.columns(), ["FECHA HECHO", "CANTIDAD"]);
        assert_eq!(batch.rows()[0]["CANTIDAD"], "2");
    }

    #[test]
    fn test_content_hash_is_stable() {
        let mut a = ContentHasher::default();
        a.update(b"[]");
        let mut b = ContentHasher::default();
        b.update(b"[]");
        assert_eq!(a.finish(), b.finish());
    }
}
