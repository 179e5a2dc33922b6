//! Incremental Loader - watermark-driven load of the homicide fact table
//!
//! Sequence per run:
//!   fetch -> normalize -> read watermark -> filter -> upsert -> advance watermark
//!
//! Nothing is written before the filter step, so fetch and schema failures
//! leave the warehouse untouched. The watermark only advances after every
//! surviving row was upserted.

use crate::error::{EtlError, Result};
use crate::extract::Source;
use crate::facts::FactStore;
use crate::transform::{normalize, CoercionReport, HomicideRecord};
use crate::watermark::WatermarkStore;
use chrono::NaiveDate;
use serde::Serialize;

/// Knobs for one loader run.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub process_name: String,
    pub source_tag: String,
    pub dataset_url: String,
    pub dry_run: bool,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// No row newer than the watermark; nothing written.
    UpToDate { watermark: Option<NaiveDate> },
    /// Rows upserted and watermark advanced.
    Loaded {
        rows: usize,
        previous: Option<NaiveDate>,
        watermark: NaiveDate,
    },
    /// Dry run: what would have been loaded.
    DryRun {
        rows: usize,
        previous: Option<NaiveDate>,
        watermark: NaiveDate,
    },
}

/// Counts and outcome for the run audit.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub fetched: usize,
    pub normalized: usize,
    pub coercions: CoercionReport,
    pub content_hash: Option<String>,
    #[serde(flatten)]
    pub outcome: LoadOutcome,
}

pub struct IncrementalLoader<'a> {
    source: &'a dyn Source,
    watermarks: &'a dyn WatermarkStore,
    facts: &'a dyn FactStore,
    settings: LoaderSettings,
}

impl<'a> IncrementalLoader<'a> {
    pub fn new(
        source: &'a dyn Source,
        watermarks: &'a dyn WatermarkStore,
        facts: &'a dyn FactStore,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            source,
            watermarks,
            facts,
            settings,
        }
    }

    pub async fn run(&self) -> Result<LoadReport> {
        let process = self.settings.process_name.as_str();
        tracing::info!(process, dry_run = self.settings.dry_run, "starting incremental load");

        let batch = self
            .source
            .fetch_all(&self.settings.dataset_url)
            .await
            .inspect_err(|e| log_failure(process, e))?;
        let fetched = batch.len();
        let content_hash = batch.content_hash().map(str::to_string);

        let normalized =
            normalize(batch, &self.settings.source_tag).inspect_err(|e| log_failure(process, e))?;
        tracing::info!(process, fetched, normalized = normalized.records.len(), "normalized batch");

        let previous = self
            .watermarks
            .read(process)
            .await
            .inspect_err(|e| log_failure(process, e))?;

        let normalized_count = normalized.records.len();
        let coercions = normalized.coercions;
        let pending = filter_newer(normalized.records, previous);
        let report = |outcome| LoadReport {
            fetched,
            normalized: normalized_count,
            coercions: coercions.clone(),
            content_hash: content_hash.clone(),
            outcome,
        };

        let Some(watermark) = max_event_date(&pending) else {
            tracing::info!(process, watermark = ?previous, "no new rows to load");
            return Ok(report(LoadOutcome::UpToDate {
                watermark: previous,
            }));
        };

        if self.settings.dry_run {
            tracing::info!(
                process,
                rows = pending.len(),
                watermark = %watermark,
                "dry run - nothing written"
            );
            return Ok(report(LoadOutcome::DryRun {
                rows: pending.len(),
                previous,
                watermark,
            }));
        }

        let rows = self
            .facts
            .upsert(&pending)
            .await
            .inspect_err(|e| log_failure(process, e))?;
        tracing::info!(process, rows, "upserted facts");

        self.watermarks
            .write(process, watermark)
            .await
            .inspect_err(|e| log_failure(process, e))?;
        tracing::info!(process, rows, previous = ?previous, watermark = %watermark, "load complete");

        Ok(report(LoadOutcome::Loaded {
            rows,
            previous,
            watermark,
        }))
    }
}

/// Keeps rows strictly newer than the watermark; all rows when absent.
pub fn filter_newer(records: Vec<HomicideRecord>, watermark: Option<NaiveDate>) -> Vec<HomicideRecord> {
    match watermark {
        Some(w) => records.into_iter().filter(|r| r.event_date > w).collect(),
        None => records,
    }
}

pub fn max_event_date(records: &[HomicideRecord]) -> Option<NaiveDate> {
    records.iter().map(|r| r.event_date).max()
}

fn log_failure(process: &str, err: &EtlError) {
    tracing::error!(process, stage = err.stage(), error = %err, "incremental load failed");
}
