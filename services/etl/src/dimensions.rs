//! Dimension Refresh - wholesale replacement of the department and
//! municipality lookup tables.
//!
//! No incremental logic: every run downloads both reference datasets and
//! swaps the table contents inside one transaction per table. An empty
//! download leaves the existing table untouched.

use crate::batch::RawBatch;
use crate::error::{EtlError, Result};
use crate::extract::Source;
use crate::transform::{
    missing_columns, resolve_aliases, DEPARTMENT_CODE, DEPARTMENT_NAME, MUNICIPALITY_CODE,
    MUNICIPALITY_NAME,
};
use crate::warehouse::Warehouse;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;

const DEPARTMENT_ALIASES: &[(&str, &str)] = &[
    ("codigodepartamento", DEPARTMENT_CODE),
    ("coddepto", DEPARTMENT_CODE),
    ("coddpto", DEPARTMENT_CODE),
    ("nombredepartamento", DEPARTMENT_NAME),
    ("departamento", DEPARTMENT_NAME),
];

const MUNICIPALITY_ALIASES: &[(&str, &str)] = &[
    ("codmpio", MUNICIPALITY_CODE),
    ("codmuni", MUNICIPALITY_CODE),
    ("codigomunicipio", MUNICIPALITY_CODE),
    ("coddpto", DEPARTMENT_CODE),
    ("coddepto", DEPARTMENT_CODE),
    ("codigodepartamento", DEPARTMENT_CODE),
    ("nombremunicipio", MUNICIPALITY_NAME),
    ("nommpio", MUNICIPALITY_NAME),
    ("municipio", MUNICIPALITY_NAME),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Department {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Municipality {
    pub code: String,
    pub department_code: String,
    pub name: String,
}

#[async_trait]
pub trait DimensionStore: Send + Sync {
    async fn replace_departments(&self, rows: &[Department]) -> Result<()>;
    async fn replace_municipalities(&self, rows: &[Municipality]) -> Result<()>;
}

/// Row counts written by one refresh; `None` means the download was empty
/// and the table was kept as is.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub departments: Option<usize>,
    pub municipalities: Option<usize>,
}

pub struct DimensionRefresh<'a> {
    source: &'a dyn Source,
    store: &'a dyn DimensionStore,
    departments_url: &'a str,
    municipalities_url: &'a str,
}

impl<'a> DimensionRefresh<'a> {
    pub fn new(
        source: &'a dyn Source,
        store: &'a dyn DimensionStore,
        departments_url: &'a str,
        municipalities_url: &'a str,
    ) -> Self {
        Self {
            source,
            store,
            departments_url,
            municipalities_url,
        }
    }

    pub async fn run(&self) -> Result<RefreshSummary> {
        let mut summary = RefreshSummary::default();

        let batch = self.source.fetch_all(self.departments_url).await?;
        if batch.is_empty() {
            tracing::warn!(url = self.departments_url, "no department rows downloaded");
        } else {
            let rows = departments_from_batch(batch)?;
            self.store.replace_departments(&rows).await?;
            tracing::info!(rows = rows.len(), "dim_departments replaced");
            summary.departments = Some(rows.len());
        }

        let batch = self.source.fetch_all(self.municipalities_url).await?;
        if batch.is_empty() {
            tracing::warn!(url = self.municipalities_url, "no municipality rows downloaded");
        } else {
            let rows = municipalities_from_batch(batch)?;
            self.store.replace_municipalities(&rows).await?;
            tracing::info!(rows = rows.len(), "dim_municipalities replaced");
            summary.municipalities = Some(rows.len());
        }

        Ok(summary)
    }
}

/// Projects the reference batch to `(code, name)` and drops duplicates,
/// keeping first-seen order.
pub fn departments_from_batch(mut batch: RawBatch) -> Result<Vec<Department>> {
    resolve_aliases(&mut batch, DEPARTMENT_ALIASES);
    require(&batch, &[DEPARTMENT_CODE, DEPARTMENT_NAME])?;

    let rows = batch.rows().iter().map(|row| Department {
        code: cell(row, DEPARTMENT_CODE),
        name: cell(row, DEPARTMENT_NAME),
    });
    Ok(dedup(rows))
}

pub fn municipalities_from_batch(mut batch: RawBatch) -> Result<Vec<Municipality>> {
    resolve_aliases(&mut batch, MUNICIPALITY_ALIASES);
    require(&batch, &[MUNICIPALITY_CODE, DEPARTMENT_CODE, MUNICIPALITY_NAME])?;

    let rows = batch.rows().iter().map(|row| Municipality {
        code: cell(row, MUNICIPALITY_CODE),
        department_code: cell(row, DEPARTMENT_CODE),
        name: cell(row, MUNICIPALITY_NAME),
    });
    Ok(dedup(rows))
}

fn require(batch: &RawBatch, columns: &[&str]) -> Result<()> {
    let missing = missing_columns(batch, columns);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EtlError::Schema { missing })
    }
}

fn cell(row: &Map<String, Value>, column: &str) -> String {
    match row.get(column) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn dedup<T: Clone + Eq + std::hash::Hash>(rows: impl Iterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    rows.filter(|r| seen.insert(r.clone())).collect()
}

#[async_trait]
impl DimensionStore for Warehouse {
    async fn replace_departments(&self, rows: &[Department]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| EtlError::store("replace dim_departments", e))?;

        sqlx::query("DELETE FROM dim_departments")
            .execute(&mut *tx)
            .await
            .map_err(|e| EtlError::store("replace dim_departments", e))?;

        for chunk in rows.chunks(self.upsert_batch_size()) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO dim_departments (department_code, department_name) ");
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.code.as_str()).push_bind(r.name.as_str());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| EtlError::store("replace dim_departments", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| EtlError::store("replace dim_departments", e))
    }

    async fn replace_municipalities(&self, rows: &[Municipality]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| EtlError::store("replace dim_municipalities", e))?;

        sqlx::query("DELETE FROM dim_municipalities")
            .execute(&mut *tx)
            .await
            .map_err(|e| EtlError::store("replace dim_municipalities", e))?;

        for chunk in rows.chunks(self.upsert_batch_size()) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO dim_municipalities (municipality_code, department_code, municipality_name) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.code.as_str())
                    .push_bind(r.department_code.as_str())
                    .push_bind(r.name.as_str());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| EtlError::store("replace dim_municipalities", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| EtlError::store("replace dim_municipalities", e))
    }
}
