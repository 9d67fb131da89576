//! Materialization pipeline: rotated CSV batches into the lakehouse.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ rotated CSV  │  (one per uploader poll, per file)
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │   pipeline   │  extract sources, split, convert to Parquet
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │    store     │  S3-compatible object store, source-scoped keys
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ table/engine │  ensure Iceberg table, INSERT via async SQL job
//! └──────────────┘
//! ```
//!
//! Failures are isolated per source after the split; the engine job poll is
//! the only place the pipeline waits on remote state.

mod convert;
mod engine;
mod pipeline;
mod store;
mod table;

pub use engine::{QueryEngineClient, QueryEngineConfig};
pub use pipeline::{all_inserted, MaterializationPipeline, PromotionResult, TableKind};
pub use store::{ObjectStoreClient, StoreConfig};
pub use table::{TableManager, RAW_TABLE_NAME};
