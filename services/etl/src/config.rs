//! Environment configuration.

use crate::error::{EtlError, Result};
use std::time::Duration;

pub const DEFAULT_HOMICIDES_URL: &str = "https://www.datos.gov.co/resource/m8fd-ahd9.json";
pub const DEFAULT_DEPARTMENTS_URL: &str = "https://www.datos.gov.co/resource/vcjz-niiq.json";
pub const DEFAULT_MUNICIPALITIES_URL: &str = "https://www.datos.gov.co/resource/gdxc-w37w.json";
pub const DEFAULT_PROCESS_NAME: &str = "homicidios_api";
pub const DEFAULT_SOURCE_TAG: &str = "API_HOMICIDIOS";

/// Postgres caps bind parameters per statement at 65535; nine per fact row.
const MAX_UPSERT_BATCH: usize = 7000;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub db_max_connections: u32,
    pub homicides_url: String,
    pub departments_url: String,
    pub municipalities_url: String,
    pub page_size: usize,
    pub http_timeout: Duration,
    pub app_token: Option<String>,
    pub process_name: String,
    pub source_tag: String,
    pub upsert_batch_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests never touch
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let upsert_batch_size = parse_number(&lookup, "UPSERT_BATCH_SIZE", 1000usize)?;
        if upsert_batch_size == 0 || upsert_batch_size > MAX_UPSERT_BATCH {
            return Err(EtlError::Config(format!(
                "UPSERT_BATCH_SIZE must be between 1 and {MAX_UPSERT_BATCH}"
            )));
        }

        let page_size = parse_number(&lookup, "PAGE_SIZE", 50_000usize)?;
        if page_size == 0 {
            return Err(EtlError::Config("PAGE_SIZE must be > 0".to_string()));
        }

        Ok(Self {
            db_url: database_url(&lookup)?,
            db_max_connections: parse_number(&lookup, "DB_MAX_CONNECTIONS", 5u32)?,
            homicides_url: var("HOMICIDES_URL", DEFAULT_HOMICIDES_URL),
            departments_url: var("DEPARTMENTS_URL", DEFAULT_DEPARTMENTS_URL),
            municipalities_url: var("MUNICIPALITIES_URL", DEFAULT_MUNICIPALITIES_URL),
            page_size,
            http_timeout: Duration::from_secs(parse_number(&lookup, "HTTP_TIMEOUT_SECS", 120u64)?),
            app_token: lookup("SOCRATA_APP_TOKEN").filter(|t| !t.trim().is_empty()),
            process_name: var("PROCESS_NAME", DEFAULT_PROCESS_NAME),
            source_tag: var("SOURCE_TAG", DEFAULT_SOURCE_TAG),
            upsert_batch_size,
        })
    }
}

/// `DB_URL` wins; otherwise the URL is assembled from the split
/// `DB_HOST`/`DB_PORT`/`DB_USER`/`DB_PASS`/`DB_NAME` variables.
fn database_url<F>(lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("DB_URL") {
        return Ok(url);
    }

    let required = |key: &str| {
        lookup(key).ok_or_else(|| EtlError::Config(format!("DB_URL or {key} env var missing")))
    };
    let host = required("DB_HOST")?;
    let user = required("DB_USER")?;
    let name = required("DB_NAME")?;
    let port = lookup("DB_PORT").unwrap_or_else(|| "5432".to_string());

    Ok(match lookup("DB_PASS") {
        Some(pass) => format!("postgres://{user}:{pass}@{host}:{port}/{name}"),
        None => format!("postgres://{user}@{host}:{port}/{name}"),
    })
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EtlError::Config(format!("{key} must be a number, got '{raw}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_db_url() {
        let config = Config::from_lookup(lookup(&[("DB_URL", "postgres://localhost/etl")])).unwrap();
        assert_eq!(config.db_url, "postgres://localhost/etl");
        assert_eq!(config.homicides_url, DEFAULT_HOMICIDES_URL);
        assert_eq!(config.process_name, "homicidios_api");
        assert_eq!(config.source_tag, "API_HOMICIDIOS");
        assert_eq!(config.page_size, 50_000);
        assert_eq!(config.upsert_batch_size, 1000);
        assert_eq!(config.http_timeout, Duration::from_secs(120));
        assert!(config.app_token.is_none());
    }

    #[test]
    fn test_db_url_from_parts() {
        let config = Config::from_lookup(lookup(&[
            ("DB_HOST", "db"),
            ("DB_USER", "etl"),
            ("DB_PASS", "secret"),
            ("DB_NAME", "warehouse"),
        ]))
        .unwrap();
        assert_eq!(config.db_url, "postgres://etl:secret@db:5432/warehouse");
    }

    #[test]
    fn test_missing_db_settings_fails() {
        let err = Config::from_lookup(lookup(&[("DB_HOST", "db")])).unwrap_err();
        assert!(err.to_string().contains("DB_USER"));
    }

    #[test]
    fn test_invalid_number_fails() {
        let err = Config::from_lookup(lookup(&[
            ("DB_URL", "postgres://localhost/etl"),
            ("PAGE_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_upsert_batch_size_bounds() {
        let err = Config::from_lookup(lookup(&[
            ("DB_URL", "postgres://localhost/etl"),
            ("UPSERT_BATCH_SIZE", "10000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("UPSERT_BATCH_SIZE"));
    }

    #[test]
    fn test_blank_app_token_ignored() {
        let config = Config::from_lookup(lookup(&[
            ("DB_URL", "postgres://localhost/etl"),
            ("SOCRATA_APP_TOKEN", "  "),
        ]))
        .unwrap();
        assert!(config.app_token.is_none());
    }
}
