//! In-memory stores and sources for tests. Every mutating call is recorded so
//! tests can assert that nothing was written.

use crate::batch::RawBatch;
use crate::dimensions::{Department, DimensionStore, Municipality};
use crate::error::{EtlError, Result};
use crate::extract::Source;
use crate::facts::FactStore;
use crate::transform::HomicideRecord;
use crate::watermark::WatermarkStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    UpsertFacts { rows: usize },
    WriteWatermark { process: String, date: NaiveDate },
    ReplaceDepartments { rows: usize },
    ReplaceMunicipalities { rows: usize },
}

type FactKey = (NaiveDate, String, String, String, String, String);

fn fact_key(record: &HomicideRecord) -> FactKey {
    let (date, depto, muni, zone, sex, tag) = record.natural_key();
    (
        date,
        depto.to_string(),
        muni.to_string(),
        zone.to_string(),
        sex.to_string(),
        tag.to_string(),
    )
}

#[derive(Default)]
pub struct MemoryStore {
    watermarks: Mutex<HashMap<String, NaiveDate>>,
    facts: Mutex<BTreeMap<FactKey, (HomicideRecord, DateTime<Utc>)>>,
    departments: Mutex<Vec<Department>>,
    municipalities: Mutex<Vec<Municipality>>,
    ops: Mutex<Vec<StoreOp>>,
    fail_upsert: Mutex<bool>,
}

impl MemoryStore {
    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().expect("lock").clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().expect("lock").clear();
    }

    /// Fact rows ordered by natural key.
    pub fn facts(&self) -> Vec<HomicideRecord> {
        self.facts
            .lock()
            .expect("lock")
            .values()
            .map(|(record, _)| record.clone())
            .collect()
    }

    /// When the row with `record`'s natural key was last upserted.
    pub fn ingested_at(&self, record: &HomicideRecord) -> Option<DateTime<Utc>> {
        self.facts
            .lock()
            .expect("lock")
            .get(&fact_key(record))
            .map(|(_, at)| *at)
    }

    pub fn departments(&self) -> Vec<Department> {
        self.departments.lock().expect("lock").clone()
    }

    pub fn municipalities(&self) -> Vec<Municipality> {
        self.municipalities.lock().expect("lock").clone()
    }

    /// Makes the next upserts fail before writing anything.
    pub fn fail_upserts(&self) {
        *self.fail_upsert.lock().expect("lock") = true;
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().expect("lock").push(op);
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn read(&self, process_name: &str) -> Result<Option<NaiveDate>> {
        Ok(self.watermarks.lock().expect("lock").get(process_name).copied())
    }

    async fn write(&self, process_name: &str, date: NaiveDate) -> Result<()> {
        self.record(StoreOp::WriteWatermark {
            process: process_name.to_string(),
            date,
        });
        self.watermarks
            .lock()
            .expect("lock")
            .insert(process_name.to_string(), date);
        Ok(())
    }
}

#[async_trait]
impl FactStore for MemoryStore {
    async fn upsert(&self, records: &[HomicideRecord]) -> Result<usize> {
        self.record(StoreOp::UpsertFacts { rows: records.len() });
        if *self.fail_upsert.lock().expect("lock") {
            return Err(EtlError::store_message("upsert raw_homicides", "injected failure"));
        }

        let mut facts = self.facts.lock().expect("lock");
        for record in records {
            facts.insert(fact_key(record), (record.clone(), Utc::now()));
        }
        Ok(records.len())
    }
}

#[async_trait]
impl DimensionStore for MemoryStore {
    async fn replace_departments(&self, rows: &[Department]) -> Result<()> {
        self.record(StoreOp::ReplaceDepartments { rows: rows.len() });
        *self.departments.lock().expect("lock") = rows.to_vec();
        Ok(())
    }

    async fn replace_municipalities(&self, rows: &[Municipality]) -> Result<()> {
        self.record(StoreOp::ReplaceMunicipalities { rows: rows.len() });
        *self.municipalities.lock().expect("lock") = rows.to_vec();
        Ok(())
    }
}

/// Serves canned JSON records per URL. Unknown URLs fail like a 404.
#[derive(Default)]
pub struct StaticSource {
    datasets: HashMap<String, Vec<Value>>,
    calls: Mutex<Vec<String>>,
}

impl StaticSource {
    pub fn with(mut self, url: &str, records: Vec<Value>) -> Self {
        self.datasets.insert(url.to_string(), records);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Source for StaticSource {
    async fn fetch_all(&self, url: &str) -> Result<RawBatch> {
        self.calls.lock().expect("lock").push(url.to_string());
        match self.datasets.get(url) {
            Some(records) => Ok(RawBatch::from_records(records.clone())),
            None => Err(EtlError::Transport {
                url: url.to_string(),
                message: "unexpected status 404 Not Found".to_string(),
                source: None,
            }),
        }
    }
}

/// A normalized fact dated 2024-06-`day` in Bogota.
pub fn fact(day: u32, zone: &str, count: i64) -> HomicideRecord {
    HomicideRecord {
        event_date: NaiveDate::from_ymd_opt(2024, 6, day).expect("valid day"),
        department_code: "11".to_string(),
        department_name: "Bogota D.C.".to_string(),
        municipality_code: "11001".to_string(),
        municipality_name: "Bogota D.C.".to_string(),
        zone: zone.to_string(),
        sex: "Masculino".to_string(),
        count,
        source_tag: "API_HOMICIDIOS".to_string(),
    }
}
