//! Postgres warehouse handle.
//!
//! The pool is opened once at process start, passed by reference to every
//! component that needs it, and closed explicitly before exit.

use crate::config::Config;
use crate::error::{EtlError, Result};
use crate::transform::HomicideRecord;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct Warehouse {
    pool: PgPool,
    upsert_batch_size: usize,
}

impl Warehouse {
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.db_url)
            .await
            .map_err(|e| EtlError::store("connect", e))?;

        tracing::info!(max_connections = config.db_max_connections, "connected to warehouse");
        Ok(Self {
            pool,
            upsert_batch_size: config.upsert_batch_size,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn upsert_batch_size(&self) -> usize {
        self.upsert_batch_size
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EtlError::store("migrate", e.into()))?;
        tracing::info!("migrations applied");
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
        tracing::info!("warehouse connection closed");
    }

    /// Writes the whole fact table to a CSV snapshot, ordered by date, with the
    /// dashboard's column headers (`FECHA HECHO`, `CANTIDAD`, ...).
    pub async fn export_facts_csv(&self, path: &Path) -> Result<usize> {
        let rows: Vec<FactRow> = sqlx::query_as(
            r#"
            SELECT event_date, department_code, department_name, municipality_code,
                   municipality_name, zone, sex, count, source_tag
            FROM raw_homicides
            ORDER BY event_date, department_code, municipality_code, zone, sex
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EtlError::store("export raw_homicides", e))?;

        let exported = rows.len();
        let records: Vec<HomicideRecord> = rows.into_iter().map(HomicideRecord::from).collect();
        let mut writer = csv::Writer::from_path(path)?;
        write_export(&mut writer, &records)?;
        writer.flush().map_err(|source| EtlError::Io {
            path: path.display().to_string(),
            source,
        })?;

        tracing::info!(path = %path.display(), rows = exported, "exported fact snapshot");
        Ok(exported)
    }

    /// Opens a run audit row in `running` state.
    pub async fn start_run(&self, process_name: &str) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO etl_runs (run_id, process_name, status, detail)
            VALUES ($1, $2, 'running', '{}')
            "#,
        )
        .bind(run_id)
        .bind(process_name)
        .execute(&self.pool)
        .await
        .map_err(|e| EtlError::store("start run", e))?;

        Ok(run_id)
    }

    /// Closes a run audit row; `detail` is merged into the stored JSON.
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        detail: serde_json::Value,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE etl_runs
            SET finished_at = now(), status = $2, error = $3, detail = detail || $4
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| EtlError::store("finish run", e))?;

        Ok(())
    }

    /// Most recent runs, newest first.
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        sqlx::query_as(
            r#"
            SELECT run_id, process_name, started_at, finished_at, status, error
            FROM etl_runs
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EtlError::store("list runs", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Noop,
    DryRun,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Noop => "noop",
            Self::DryRun => "dry_run",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub process_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error: Option<String>,
}

/// Fact row as the dashboard reads it: upper-case Spanish headers and
/// day-first dates. The fact aliases resolve every header, so the file loads
/// back through `run --from-file`.
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    #[serde(rename = "FECHA HECHO")]
    event_date: String,
    #[serde(rename = "COD DEPTO")]
    department_code: &'a str,
    #[serde(rename = "DEPARTAMENTO")]
    department_name: &'a str,
    #[serde(rename = "COD MUNI")]
    municipality_code: &'a str,
    #[serde(rename = "MUNICIPIO")]
    municipality_name: &'a str,
    #[serde(rename = "ZONA")]
    zone: &'a str,
    #[serde(rename = "SEXO")]
    sex: &'a str,
    #[serde(rename = "CANTIDAD")]
    count: i64,
    #[serde(rename = "FUENTE")]
    source_tag: &'a str,
}

impl<'a> From<&'a HomicideRecord> for ExportRow<'a> {
    fn from(r: &'a HomicideRecord) -> Self {
        Self {
            event_date: r.event_date.format("%d/%m/%Y").to_string(),
            department_code: &r.department_code,
            department_name: &r.department_name,
            municipality_code: &r.municipality_code,
            municipality_name: &r.municipality_name,
            zone: &r.zone,
            sex: &r.sex,
            count: r.count,
            source_tag: &r.source_tag,
        }
    }
}

fn write_export<W: std::io::Write>(writer: &mut csv::Writer<W>, records: &[HomicideRecord]) -> Result<()> {
    for record in records {
        writer.serialize(ExportRow::from(record))?;
    }
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct FactRow {
    event_date: NaiveDate,
    department_code: String,
    department_name: String,
    municipality_code: String,
    municipality_name: String,
    zone: String,
    sex: String,
    count: i64,
    source_tag: String,
}

impl From<FactRow> for HomicideRecord {
    fn from(row: FactRow) -> Self {
        Self {
            event_date: row.event_date,
            department_code: row.department_code,
            department_name: row.department_name,
            municipality_code: row.municipality_code,
            municipality_name: row.municipality_name,
            zone: row.zone,
            sex: row.sex,
            count: row.count,
            source_tag: row.source_tag,
        }
    }
}

#[cfg(test)]
impl Warehouse {
    /// Connects to the configured test database (`DB_URL`), applies the
    /// migrations and shrinks the chunk size so multi-statement paths run.
    pub(crate) async fn for_tests() -> Result<Self> {
        let config = Config::from_env()?;
        let mut warehouse = Self::connect(&config).await?;
        warehouse.migrate().await?;
        warehouse.upsert_batch_size = 2;
        Ok(warehouse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RawBatch;
    use crate::memory::fact;
    use crate::transform::normalize;

    fn export_to_string(records: &[HomicideRecord]) -> String {
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_export(&mut writer, records).unwrap();
        String::from_utf8(writer.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn test_export_uses_dashboard_headers() {
        let csv = export_to_string(&[fact(1, "Urbana", 4)]);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("FECHA HECHO,COD DEPTO,DEPARTAMENTO,COD MUNI,MUNICIPIO,ZONA,SEXO,CANTIDAD,FUENTE")
        );
        assert_eq!(
            lines.next(),
            Some("01/06/2024,11,Bogota D.C.,11001,Bogota D.C.,Urbana,Masculino,4,API_HOMICIDIOS")
        );
    }

    #[test]
    fn test_export_loads_back_as_snapshot() {
        let records = vec![fact(1, "Urbana", 4), fact(28, "Rural", 0)];
        let csv = export_to_string(&records);

        let batch = RawBatch::from_csv_reader(csv.as_bytes()).unwrap();
        let reloaded = normalize(batch, "API_HOMICIDIOS").unwrap();

        assert!(reloaded.coercions.is_clean());
        assert_eq!(reloaded.records, records);
    }

    #[test]
    fn test_run_status_strings() {
        assert_eq!(RunStatus::Ok.as_str(), "ok");
        assert_eq!(RunStatus::DryRun.as_str(), "dry_run");
        assert_eq!(
            serde_json::to_value(RunStatus::Noop).unwrap(),
            serde_json::json!("noop")
        );
    }
}
