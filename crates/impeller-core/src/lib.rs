//! Shared domain model for the Impeller telemetry pipeline.
//!
//! This crate holds the pieces that every Impeller component agrees on:
//!
//! - [`record`] - raw broker messages and their decomposed form
//! - [`registry`] - the fixed set of known motor-pump identifiers
//! - [`metrics`] - Prometheus recorder bootstrap and metric descriptions
//! - [`error`] - decomposition error type
//!
//! The ingestion daemon (`impeller-ingest`) builds on these types; keeping
//! them here means the column names and source-id rules that the lakehouse
//! tables depend on are defined exactly once.

pub mod error;
pub mod metrics;
pub mod record;
pub mod registry;

pub use error::{Error, Result};
pub use record::{ParsedRecord, RawRecord};
pub use registry::SourceRegistry;
