//! Watermark store: last loaded event date per named process.

use crate::error::{EtlError, Result};
use crate::warehouse::Warehouse;
use async_trait::async_trait;
use chrono::NaiveDate;

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Last recorded watermark, `None` when the process never loaded.
    async fn read(&self, process_name: &str) -> Result<Option<NaiveDate>>;

    /// Atomic insert-or-update so the process watermark becomes `date`.
    async fn write(&self, process_name: &str, date: NaiveDate) -> Result<()>;
}

#[async_trait]
impl WatermarkStore for Warehouse {
    async fn read(&self, process_name: &str) -> Result<Option<NaiveDate>> {
        let row: Option<(NaiveDate,)> =
            sqlx::query_as("SELECT last_loaded_date FROM etl_control WHERE process_name = $1")
                .bind(process_name)
                .fetch_optional(self.pool())
                .await
                .map_err(|e| EtlError::store("read watermark", e))?;

        Ok(row.map(|r| r.0))
    }

    async fn write(&self, process_name: &str, date: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO etl_control (process_name, last_loaded_date)
            VALUES ($1, $2)
            ON CONFLICT (process_name)
            DO UPDATE SET last_loaded_date = EXCLUDED.last_loaded_date, updated_at = now()
            "#,
        )
        .bind(process_name)
        .bind(date)
        .execute(self.pool())
        .await
        .map_err(|e| EtlError::store("write watermark", e))?;

        Ok(())
    }
}
