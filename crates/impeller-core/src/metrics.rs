//! Prometheus metrics helpers for the Impeller system.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across Impeller components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use impeller_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize the Prometheus recorder
//!     let handle = init_metrics();
//!
//!     // Start the HTTP server for /metrics endpoint
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     // Now use metrics anywhere in your code
//!     use metrics::{counter, gauge};
//!     counter!("broker_messages_total").increment(1);
//!     gauge!("buffer_records").set(42.0);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`broker_`, `rotation_`, `promotion_`, `engine_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: used sparingly to avoid cardinality explosion

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already
/// installed, instead of panicking. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. This spawns a
/// background task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

/// Register descriptions for the metrics used across Impeller.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Broker Listener Metrics
    // =========================================================================

    describe_counter!(
        "broker_messages_total",
        "Total messages received from the broker"
    );
    describe_counter!(
        "broker_connects_total",
        "Successful broker connections (including reconnects)"
    );
    describe_counter!(
        "broker_connection_errors_total",
        "Broker connection or polling errors"
    );
    describe_counter!(
        "broker_subscribe_failures_total",
        "Topic subscriptions that could not be established"
    );
    describe_gauge!(
        "broker_connected",
        "Whether the broker connection is live (1=yes, 0=no)"
    );

    // =========================================================================
    // Buffer & Rotation Metrics
    // =========================================================================

    describe_gauge!("buffer_records", "Records currently buffered in memory");
    describe_counter!("rotation_batches_total", "Rotation batches written");
    describe_counter!(
        "rotation_records_total",
        "Raw records flushed into rotation batches"
    );
    describe_counter!(
        "rotation_parse_drops_total",
        "Records dropped from structured output due to decomposition failure"
    );
    describe_counter!(
        "rotation_write_failures_total",
        "Structured files skipped because of a write failure"
    );

    // =========================================================================
    // Promotion Uploader Metrics
    // =========================================================================

    describe_counter!(
        "promotion_files_total",
        "Files handed to the materialization pipeline (label: result)"
    );
    describe_counter!(
        "promotion_deadletter_total",
        "Files moved to the dead-letter directory after repeated failures"
    );
    describe_gauge!(
        "promotion_pending_files",
        "Files observed but not yet successfully promoted"
    );

    // =========================================================================
    // Materialization Pipeline Metrics
    // =========================================================================

    describe_counter!(
        "store_uploads_total",
        "Parquet objects uploaded to the object store"
    );
    describe_counter!(
        "store_upload_bytes_total",
        "Bytes uploaded to the object store"
    );
    describe_counter!(
        "engine_jobs_total",
        "Query engine jobs submitted (label: state)"
    );
    describe_histogram!(
        "engine_job_poll_seconds",
        "Time spent polling a query engine job to completion"
    );
    describe_counter!(
        "lakehouse_inserts_total",
        "Per-source inserts confirmed in the lakehouse"
    );
    describe_counter!(
        "lakehouse_tables_created_total",
        "Lakehouse tables created on first promotion"
    );
}
