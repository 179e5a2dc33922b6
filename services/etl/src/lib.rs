//! Homicide ETL - incremental load of open-data homicide records into a
//! Postgres warehouse.
//!
//! - `extract`: paginated Socrata fetcher and local CSV snapshots
//! - `transform`: column alias resolution, coercion, text normalization
//! - `pipeline`: watermark-driven incremental loader
//! - `dimensions`: department/municipality lookup refresh
//! - `warehouse`, `watermark`, `facts`: Postgres persistence

pub mod batch;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod extract;
pub mod facts;
pub mod pipeline;
pub mod transform;
pub mod warehouse;
pub mod watermark;

#[cfg(test)]
pub(crate) mod memory;

pub use error::{EtlError, Result};
