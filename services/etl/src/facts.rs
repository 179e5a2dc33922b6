//! Raw fact table writes.

use crate::error::{EtlError, Result};
use crate::transform::HomicideRecord;
use crate::warehouse::Warehouse;
use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Inserts new natural keys and updates `count` (refreshing the ingestion
    /// timestamp) on existing ones. Returns the number of rows written.
    async fn upsert(&self, records: &[HomicideRecord]) -> Result<usize>;
}

/// Collapses repeated natural keys, keeping the last occurrence at the
/// position of the first. Equivalent to upserting the rows one by one.
pub fn collapse_last_wins(records: &[HomicideRecord]) -> Vec<&HomicideRecord> {
    let mut index = HashMap::new();
    let mut out: Vec<&HomicideRecord> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.natural_key()) {
            Some(&pos) => out[pos] = record,
            None => {
                index.insert(record.natural_key(), out.len());
                out.push(record);
            }
        }
    }
    out
}

#[async_trait]
impl FactStore for Warehouse {
    /// Each chunk is one statement; there is no transaction across chunks, so
    /// a failure mid-way leaves earlier chunks committed.
    async fn upsert(&self, records: &[HomicideRecord]) -> Result<usize> {
        let rows = collapse_last_wins(records);
        if rows.len() < records.len() {
            tracing::info!(
                collapsed = records.len() - rows.len(),
                "collapsed duplicate natural keys"
            );
        }

        let mut written = 0;
        for chunk in rows.chunks(self.upsert_batch_size()) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO raw_homicides \
                 (event_date, department_code, department_name, municipality_code, \
                  municipality_name, zone, sex, count, source_tag) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.event_date)
                    .push_bind(r.department_code.as_str())
                    .push_bind(r.department_name.as_str())
                    .push_bind(r.municipality_code.as_str())
                    .push_bind(r.municipality_name.as_str())
                    .push_bind(r.zone.as_str())
                    .push_bind(r.sex.as_str())
                    .push_bind(r.count)
                    .push_bind(r.source_tag.as_str());
            });
            qb.push(
                " ON CONFLICT (event_date, department_code, municipality_code, zone, sex, source_tag) \
                 DO UPDATE SET count = EXCLUDED.count, ingested_at = now()",
            );

            qb.build()
                .execute(self.pool())
                .await
                .map_err(|e| EtlError::store("upsert raw_homicides", e))?;

            written += chunk.len();
            tracing::debug!(written, total = rows.len(), "upserted chunk");
        }

        Ok(written)
    }
}
