//! Fetcher - downloads full dataset snapshots from Socrata endpoints
//!
//! Pagination uses `$limit`/`$offset` ordered by the row id and stops at the
//! first empty page. Any non-success status aborts the fetch: a truncated
//! snapshot would otherwise look like a complete one.

use crate::batch::{ContentHasher, RawBatch};
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

const USER_AGENT: &str = "homicidios-etl/0.1 (datos abiertos; ingestion programada)";

/// Anything that can hand back a full snapshot for an endpoint.
#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch_all(&self, url: &str) -> Result<RawBatch>;
}

/// Paginated client for Socrata (`/resource/<id>.json`) endpoints.
pub struct SocrataClient {
    client: reqwest::Client,
    page_size: usize,
    app_token: Option<String>,
}

impl SocrataClient {
    pub fn new(timeout: Duration, page_size: usize, app_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EtlError::transport("<client>", e))?;

        Ok(Self {
            client,
            page_size,
            app_token,
        })
    }

    async fn fetch_page(&self, url: &str, offset: usize) -> Result<(Vec<Value>, Vec<u8>)> {
        let mut request = self.client.get(url).query(&[
            ("$limit", self.page_size.to_string()),
            ("$offset", offset.to_string()),
            ("$order", ":id".to_string()),
        ]);
        if let Some(token) = &self.app_token {
            request = request.header("X-App-Token", token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| EtlError::transport(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EtlError::status(url, status));
        }

        let bytes = resp.bytes().await.map_err(|e| EtlError::transport(url, e))?;
        let records: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| EtlError::Transport {
            url: url.to_string(),
            message: format!("invalid JSON page at offset {offset}: {e}"),
            source: None,
        })?;

        Ok((records, bytes.to_vec()))
    }
}

#[async_trait]
impl Source for SocrataClient {
    async fn fetch_all(&self, url: &str) -> Result<RawBatch> {
        tracing::info!(url, page_size = self.page_size, "downloading dataset");

        let mut batch = RawBatch::new();
        let mut hasher = ContentHasher::default();
        let mut offset = 0;

        loop {
            let (records, bytes) = self.fetch_page(url, offset).await?;
            if records.is_empty() {
                break;
            }
            let page_len = records.len();
            hasher.update(&bytes);
            batch.extend(records);
            offset += page_len;
            tracing::info!(url, rows = batch.len(), "downloaded page");
        }

        let hash = hasher.finish();
        tracing::info!(url, rows = batch.len(), content_hash = %hash, "download complete");
        Ok(batch.with_content_hash(hash))
    }
}

/// Reads a local CSV snapshot instead of calling the API. The `url` argument
/// is ignored; the snapshot stands in for whichever dataset is requested.
pub struct CsvSnapshotSource {
    path: PathBuf,
}

impl CsvSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Source for CsvSnapshotSource {
    async fn fetch_all(&self, _url: &str) -> Result<RawBatch> {
        let path = self.path.display().to_string();
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| EtlError::Io {
                path: path.clone(),
                source,
            })?;

        let mut hasher = ContentHasher::default();
        hasher.update(&bytes);

        let batch = RawBatch::from_csv_reader(bytes.as_slice())?;
        tracing::info!(path = %path, rows = batch.len(), "loaded csv snapshot");
        Ok(batch.with_content_hash(hasher.finish()))
    }
}
