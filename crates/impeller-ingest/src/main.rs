//! Impeller ingestion daemon.
//!
//! This is the main entry point for the motor-pump telemetry service. It
//! runs two independent long-running units: the broker listener (buffering
//! and rotating inbound messages) and the promotion uploader (moving
//! rotated batches into the lakehouse). An unhandled error in one never
//! terminates the other.
//!
//! # Usage
//!
//! ```bash
//! # Run with safe local defaults (broker, object store and engine on localhost)
//! impeller-ingest
//!
//! # Point at the plant broker and a shorter rotation interval
//! impeller-ingest \
//!     --broker-host broker.plant.local \
//!     --topics 'sensors/#' \
//!     --rotation-interval-minutes 5
//! ```
//!
//! Every flag is also readable from the environment (`BROKER_HOST`,
//! `LOG_ROOT`, `ENGINE_PASSWORD`, ...), so container deployments need no
//! argument plumbing.
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) stops subscription delivery, disconnects the broker,
//! flushes any buffered records into a final rotation batch, and lets the
//! uploader finish its current cycle before exit.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use impeller_core::metrics::{init_metrics, start_metrics_server};
use impeller_core::registry::SourceRegistry;
use impeller_ingest::{
    BrokerConfig, BrokerListener, MaterializationPipeline, ObjectStoreClient, PromotionUploader,
    QueryEngineClient, QueryEngineConfig, RotationConfig, RotationLog, StoreConfig, UploaderConfig,
};

/// Impeller ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "impeller-ingest")]
#[command(about = "Motor-pump telemetry ingestion and lakehouse promotion daemon")]
#[command(version)]
struct Args {
    /// MQTT broker host
    #[arg(long, env = "BROKER_HOST", default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "BROKER_PORT", default_value = "1883")]
    broker_port: u16,

    /// Broker username
    #[arg(long, env = "BROKER_USERNAME")]
    broker_username: Option<String>,

    /// Broker password
    #[arg(long, env = "BROKER_PASSWORD")]
    broker_password: Option<String>,

    /// Enable TLS on the broker connection
    #[arg(long, env = "BROKER_TLS")]
    broker_tls: bool,

    /// Topic patterns to subscribe to (comma-separated; wildcard-all if omitted)
    #[arg(long, env = "BROKER_TOPICS", value_delimiter = ',')]
    topics: Option<Vec<String>>,

    /// Known source identifiers (comma-separated, overrides defaults)
    #[arg(long, env = "SOURCE_IDS", value_delimiter = ',')]
    sources: Option<Vec<String>>,

    /// Root directory for rotation output
    #[arg(long, env = "LOG_ROOT", default_value = "./logs")]
    log_root: PathBuf,

    /// Rotation interval in minutes
    #[arg(long, env = "ROTATION_INTERVAL_MINUTES", default_value = "10")]
    rotation_interval_minutes: f64,

    /// Uploader poll interval in seconds
    #[arg(long, env = "UPLOAD_POLL_SECONDS", default_value = "120")]
    upload_poll_seconds: u64,

    /// Promotion failures before a file is dead-lettered
    #[arg(long, env = "MAX_FILE_ATTEMPTS", default_value = "5")]
    max_file_attempts: u32,

    /// Object store endpoint
    #[arg(long, env = "STORE_ENDPOINT", default_value = "http://localhost:9000")]
    store_endpoint: String,

    /// Object store access key
    #[arg(long, env = "STORE_ACCESS_KEY", default_value = "impeller")]
    store_access_key: String,

    /// Object store secret key
    #[arg(long, env = "STORE_SECRET_KEY", default_value = "impeller-secret")]
    store_secret_key: String,

    /// Object store bucket
    #[arg(long, env = "STORE_BUCKET", default_value = "datalake")]
    store_bucket: String,

    /// Folder prefix inside the bucket
    #[arg(long, env = "STORE_FOLDER", default_value = "data")]
    store_folder: String,

    /// Query engine host
    #[arg(long, env = "ENGINE_HOST", default_value = "localhost")]
    engine_host: String,

    /// Query engine port
    #[arg(long, env = "ENGINE_PORT", default_value = "9047")]
    engine_port: u16,

    /// Query engine username
    #[arg(long, env = "ENGINE_USERNAME", default_value = "impeller")]
    engine_username: String,

    /// Query engine password
    #[arg(long, env = "ENGINE_PASSWORD", default_value = "impeller")]
    engine_password: String,

    /// Seconds a query engine job may stay non-terminal before failing
    #[arg(long, env = "ENGINE_TIMEOUT_SECONDS", default_value = "60")]
    engine_timeout_seconds: u32,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("impeller_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Impeller ingestion daemon starting...");
    tracing::info!("Configuration:");
    tracing::info!("  Broker:   {}:{}", args.broker_host, args.broker_port);
    tracing::info!("  Log root: {}", args.log_root.display());
    tracing::info!("  Rotation: {} minutes", args.rotation_interval_minutes);
    tracing::info!("  Store:    {}", args.store_endpoint);
    tracing::info!("  Engine:   {}:{}", args.engine_host, args.engine_port);

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let registry = args
        .sources
        .clone()
        .map(SourceRegistry::new)
        .unwrap_or_default();
    tracing::info!("Registered sources: {:?}", registry.sources());

    // Shared buffer between listener and uploader-side rotation
    let rotation = Arc::new(
        RotationLog::new(
            RotationConfig {
                log_root: args.log_root.clone(),
                interval: Duration::from_secs_f64(args.rotation_interval_minutes * 60.0),
                ..Default::default()
            },
            registry.clone(),
        )
        .with_context(|| format!("Failed to initialize rotation log at {:?}", args.log_root))?,
    );

    let listener = Arc::new(BrokerListener::new(
        BrokerConfig {
            host: args.broker_host.clone(),
            port: args.broker_port,
            username: args.broker_username.clone(),
            password: args.broker_password.clone(),
            tls: args.broker_tls,
            topics: args.topics.clone().unwrap_or_default(),
            ..Default::default()
        },
        Arc::clone(&rotation),
    ));

    let engine = Arc::new(
        QueryEngineClient::new(
            QueryEngineConfig {
                host: args.engine_host.clone(),
                port: args.engine_port,
                username: args.engine_username.clone(),
                password: args.engine_password.clone(),
                poll_budget: args.engine_timeout_seconds,
                ..Default::default()
            },
            Arc::clone(&running),
        )
        .context("Failed to create query engine client")?,
    );

    let store = ObjectStoreClient::new(StoreConfig {
        endpoint: args.store_endpoint.clone(),
        access_key: args.store_access_key.clone(),
        secret_key: args.store_secret_key.clone(),
        bucket: args.store_bucket.clone(),
        folder: args.store_folder.clone(),
        ..Default::default()
    })
    .await;

    let pipeline = MaterializationPipeline::new(registry, store, engine);
    let uploader = Arc::new(PromotionUploader::new(
        UploaderConfig {
            log_root: args.log_root.clone(),
            poll_interval: Duration::from_secs(args.upload_poll_seconds),
            max_file_attempts: args.max_file_attempts,
        },
        pipeline,
        Arc::clone(&running),
    ));

    // Two independent long-running units: a failure in one is logged and
    // leaves the other untouched.
    let listener_task = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move {
            if let Err(e) = listener.run().await {
                tracing::error!("Listener terminated: {e}");
            }
        }
    });

    let uploader_task = tokio::spawn({
        let uploader = Arc::clone(&uploader);
        async move { uploader.run().await }
    });

    // Wait for the shutdown signal
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    // Shutdown sequence
    tracing::info!("Shutting down...");

    listener.disconnect().await;

    // Flush whatever is still buffered; the batch is picked up on next start
    // if the uploader has already stopped.
    match rotation.rotate_now() {
        Ok(Some(batch)) => tracing::info!(
            "Flushed final rotation batch: {} records into {}",
            batch.record_count,
            batch.folder.display()
        ),
        Ok(None) => {}
        Err(e) => tracing::warn!("Final rotation flush failed: {e}"),
    }

    if let Err(e) = listener_task.await {
        tracing::warn!("Listener task panicked: {e}");
    }
    if let Err(e) = uploader_task.await {
        tracing::warn!("Uploader task panicked: {e}");
    }

    // Print summary
    let stats = listener.stats();
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Messages received:  {}", stats.messages);
    tracing::info!("Broker connects:    {}", stats.connects);
    tracing::info!("Records rotated:    {}", rotation.total_records());
    tracing::info!("Batches written:    {}", rotation.total_batches());

    Ok(())
}
