//! Impeller ingestion pipeline components.
//!
//! This crate provides the core pipeline for ingesting motor-pump telemetry
//! from an MQTT broker into a versioned, queryable lakehouse.
//!
//! # Modules
//!
//! - [`broker`] - MQTT transport listener feeding the shared buffer
//! - [`rotation`] - buffer and time-based rotation into CSV batches
//! - [`uploader`] - polling loop promoting rotated files
//! - [`lakehouse`] - conversion, object-store upload, table management and
//!   the async SQL job client
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ BrokerListener  │  MQTT subscriber, one RawRecord per message
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   RotationLog   │  shared buffer, flushed to CSV batches on interval
//! └────────┬────────┘
//!          │  (filesystem)
//!          ▼
//! ┌─────────────────┐
//! │PromotionUploader│  polls batches, deletes files on confirmed success
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Materialization │  split per source, Parquet, upload, Iceberg insert
//! └─────────────────┘
//! ```
//!
//! The raw rotation file is the durable source of truth; the lakehouse
//! tables are derived from it. Promotion is at-least-once: files survive
//! locally until their insert is confirmed.

pub mod broker;
pub mod error;
pub mod lakehouse;
pub mod rotation;
pub mod uploader;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use broker::{BrokerConfig, BrokerListener, ListenerStats};
pub use lakehouse::{
    all_inserted, MaterializationPipeline, ObjectStoreClient, PromotionResult, QueryEngineClient,
    QueryEngineConfig, StoreConfig, TableKind,
};
pub use rotation::{RotationBatch, RotationConfig, RotationLog};
pub use uploader::{PromotionUploader, Promoter, UploaderConfig};
