//! Object store client for promoted Parquet artifacts.
//!
//! Uploads land under a source-scoped key so the query engine can treat
//! each source's folder as an external dataset:
//!
//! ```text
//! s3://<bucket>/<folder>/<source_id>/<unique_filename>
//! ```
//!
//! The bucket is created on first use if it does not exist.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use metrics::counter;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Configuration for the object store connection.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Endpoint URL, e.g. `http://localhost:9000`.
    pub endpoint: String,

    /// Access key.
    pub access_key: String,

    /// Secret key.
    pub secret_key: String,

    /// Bucket promoted artifacts land in.
    /// Default: "datalake"
    pub bucket: String,

    /// Folder prefix inside the bucket.
    /// Default: "data"
    pub folder: String,

    /// Region name; S3-compatible stores accept any value here.
    pub region: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            access_key: "impeller".to_string(),
            secret_key: "impeller-secret".to_string(),
            bucket: "datalake".to_string(),
            folder: "data".to_string(),
            region: "us-east-1".to_string(),
        }
    }
}

/// S3-compatible object store client.
pub struct ObjectStoreClient {
    config: StoreConfig,
    client: S3Client,
    bucket_checked: AtomicBool,
}

impl ObjectStoreClient {
    /// Create a client against the configured endpoint.
    pub async fn new(config: StoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "impeller-static",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        // Path-style addressing: MinIO and friends do not resolve
        // virtual-hosted bucket names.
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        info!(
            "Object store client initialized: endpoint={}, bucket={}",
            config.endpoint, config.bucket
        );

        Self {
            client: S3Client::from_conf(s3_config),
            config,
            bucket_checked: AtomicBool::new(false),
        }
    }

    /// The configured folder prefix.
    pub fn folder(&self) -> &str {
        &self.config.folder
    }

    /// The configured bucket name.
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Build the object key for a source-scoped artifact.
    pub fn object_key(&self, source_id: &str, filename: &str) -> String {
        if self.config.folder.is_empty() {
            format!("{source_id}/{filename}")
        } else {
            format!("{}/{source_id}/{filename}", self.config.folder)
        }
    }

    /// Upload a local file under `key`, creating the bucket if needed.
    pub async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        self.ensure_bucket().await?;

        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| Error::Storage(format!("read {}: {e}", local.display())))?;

        debug!("Uploading {} to {}", local.display(), key);
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("put {key}: {}", DisplayErrorContext(&e))))?;

        let size = fs::metadata(local)?.len();
        counter!("store_uploads_total").increment(1);
        counter!("store_upload_bytes_total").increment(size);
        info!(
            "Upload successful: {} bytes to s3://{}/{}",
            size, self.config.bucket, key
        );

        Ok(())
    }

    /// Create the bucket if it does not exist. Checked once per process.
    async fn ensure_bucket(&self) -> Result<()> {
        if self.bucket_checked.load(Ordering::Relaxed) {
            return Ok(());
        }

        let bucket = &self.config.bucket;
        let missing = self
            .client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .is_err();

        if missing {
            info!("Creating bucket: {bucket}");
            if let Err(e) = self.client.create_bucket().bucket(bucket).send().await {
                let service_error = e.into_service_error();
                // A concurrent creator getting there first is fine.
                if !service_error.is_bucket_already_owned_by_you()
                    && !service_error.is_bucket_already_exists()
                {
                    return Err(Error::Storage(format!(
                        "create bucket {bucket}: {}",
                        DisplayErrorContext(&service_error)
                    )));
                }
            }
        }

        self.bucket_checked.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_object_key_with_folder() {
        let client = ObjectStoreClient::new(StoreConfig::default()).await;
        assert_eq!(
            client.object_key("ITU-693", "ITU-693_20250101_120000.parquet"),
            "data/ITU-693/ITU-693_20250101_120000.parquet"
        );
    }

    #[tokio::test]
    async fn test_object_key_without_folder() {
        let config = StoreConfig {
            folder: String::new(),
            ..Default::default()
        };
        let client = ObjectStoreClient::new(config).await;
        assert_eq!(client.object_key("ITU-693", "f.parquet"), "ITU-693/f.parquet");
    }
}
