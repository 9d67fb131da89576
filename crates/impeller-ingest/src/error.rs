//! Error types for the ingestion daemon.
//!
//! Variants map onto the failure surfaces of the pipeline: transport,
//! decomposition, conversion, object storage, query engine, and table
//! provisioning. Failures are isolated to the smallest unit possible (one
//! source within one file) by the callers; nothing here is fatal to the
//! listener or the uploader loop.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion and promotion.
#[derive(Error, Debug)]
pub enum Error {
    /// Broker connect/subscribe failure. Retried by reconnect, never fatal.
    #[error("transport error: {0}")]
    Transport(String),

    /// Record decomposition failure. Drops the record from structured output.
    #[error("parse error: {0}")]
    Parse(#[from] impeller_core::Error),

    /// File format failure. Aborts that file's pipeline, file retained.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Bucket/object operation failure. Aborts that source's promotion.
    #[error("storage error: {0}")]
    Storage(String),

    /// Auth/submission/timeout/remote job failure from the query engine.
    #[error("query engine error: {0}")]
    QueryEngine(String),

    /// Table create/poll-existence retries exhausted.
    #[error("table '{table}' not available after {attempts} attempts")]
    TableProvisioning {
        /// The table that never became visible.
        table: String,
        /// How many existence polls were made.
        attempts: u32,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Arrow batch construction error.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet write error.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error talking to the query engine.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_provisioning_display() {
        let err = Error::TableProvisioning {
            table: "ITU-693".to_string(),
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("ITU-693"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_core_parse_error() {
        let core_err = impeller_core::Error::TopicShape("x".to_string());
        let err: Error = core_err.into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().starts_with("parse error"));
    }
}
