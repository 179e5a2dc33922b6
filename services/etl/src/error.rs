//! Error types for the ETL pipeline.
//!
//! Every failure that aborts a run maps to one variant. Per-row coercions
//! (bad dates, bad counts) are not errors; they are counted in
//! [`crate::transform::CoercionReport`].

/// Result alias used across the pipeline.
pub type Result<T> = std::result::Result<T, EtlError>;

/// Errors that abort a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// Non-success HTTP status, network failure or undecodable body.
    #[error("transport error fetching {url}: {message}")]
    Transport {
        /// Endpoint that failed.
        url: String,
        /// What went wrong.
        message: String,
        /// Underlying HTTP client error, if any.
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Canonical columns still missing after alias resolution.
    #[error("required columns missing: {}", .missing.join(", "))]
    Schema {
        /// Canonical column names that could not be resolved.
        missing: Vec<String>,
    },

    /// Warehouse connection, read or write failure.
    #[error("store error during {operation}: {message}")]
    Store {
        /// The store operation being attempted.
        operation: &'static str,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Missing or malformed configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local snapshot file could not be read or written.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Local snapshot file is not valid CSV.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl EtlError {
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn status(url: impl Into<String>, status: reqwest::StatusCode) -> Self {
        Self::Transport {
            url: url.into(),
            message: format!("unexpected status {status}"),
            source: None,
        }
    }

    /// Wraps a sqlx failure for the named store operation.
    pub fn store(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Store {
            operation,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// A store failure without an underlying driver error.
    #[must_use]
    pub fn store_message(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Store {
            operation,
            message: message.into(),
            source: None,
        }
    }

    /// Short name of the failing stage, used in logs and the run audit.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "fetch",
            Self::Schema { .. } => "normalize",
            Self::Store { .. } => "store",
            Self::Config(_) => "config",
            Self::Io { .. } | Self::Csv(_) => "snapshot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_lists_missing_columns() {
        let err = EtlError::Schema {
            missing: vec!["count".to_string(), "sex".to_string()],
        };
        assert_eq!(err.to_string(), "required columns missing: count, sex");
        assert_eq!(err.stage(), "normalize");
    }

    #[test]
    fn test_store_message_stage() {
        let err = EtlError::store_message("upsert raw_homicides", "connection reset");
        assert!(err.to_string().contains("upsert raw_homicides"));
        assert_eq!(err.stage(), "store");
    }
}
