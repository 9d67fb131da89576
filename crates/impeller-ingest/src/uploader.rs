//! Promotion uploader loop.
//!
//! Scans completed rotation output on a fixed interval and hands every CSV
//! file to the materialization pipeline. A file is deleted locally only
//! after its promotion is confirmed; anything else stays in place for the
//! next cycle (at-least-once semantics, so downstream must tolerate
//! re-delivery).
//!
//! # Dead-lettering
//!
//! Files that keep failing are not retried forever: after
//! `max_file_attempts` failures a file is moved to
//! `<log_root>/deadletter/` for manual inspection. The attempt counter is
//! in-memory; a restart grants a failing file a fresh budget, which is
//! acceptable for an at-least-once pipeline.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::lakehouse::{all_inserted, MaterializationPipeline, PromotionResult};

/// Name of the dead-letter directory under the log root.
const DEADLETTER_DIR: &str = "deadletter";

/// Configuration for the uploader loop.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Root directory holding rotation batch folders.
    pub log_root: PathBuf,

    /// Time between scans.
    /// Default: 120 seconds.
    pub poll_interval: Duration,

    /// Failures before a file is dead-lettered.
    /// Default: 5.
    pub max_file_attempts: u32,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("./logs"),
            poll_interval: Duration::from_secs(120),
            max_file_attempts: 5,
        }
    }
}

/// Anything that can promote a rotated file.
///
/// The production implementation is [`MaterializationPipeline`]; tests use
/// scripted stand-ins.
pub trait Promoter {
    /// Promote one file, returning per-source results.
    fn promote(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<Vec<PromotionResult>>> + Send;
}

impl Promoter for MaterializationPipeline {
    fn promote(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<Vec<PromotionResult>>> + Send {
        self.process_file(path)
    }
}

/// The promotion uploader loop.
pub struct PromotionUploader<P: Promoter> {
    config: UploaderConfig,
    pipeline: P,
    running: Arc<AtomicBool>,
    failures: Mutex<HashMap<PathBuf, u32>>,
}

impl<P: Promoter> PromotionUploader<P> {
    /// Create a new uploader.
    ///
    /// `running` is the shared shutdown flag; the loop exits at the first
    /// cycle boundary after it goes false.
    pub fn new(config: UploaderConfig, pipeline: P, running: Arc<AtomicBool>) -> Self {
        Self {
            config,
            pipeline,
            running,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Run the loop until the shared flag goes false.
    pub async fn run(&self) {
        info!(
            "Promotion uploader started: root={}, interval={:?}",
            self.config.log_root.display(),
            self.config.poll_interval
        );

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.scan_once().await {
                error!("Uploader scan failed: {e}");
            }
            self.sleep_interval().await;
        }

        info!("Promotion uploader stopped");
    }

    /// Sleep one poll interval in short slices so shutdown is prompt.
    async fn sleep_interval(&self) {
        let slice = Duration::from_secs(1).min(self.config.poll_interval);
        let mut remaining = self.config.poll_interval;
        while self.running.load(Ordering::SeqCst) && !remaining.is_zero() {
            let step = slice.min(remaining);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    /// One scan over the rotation output.
    ///
    /// Per-file failures are caught and recorded; they never abort the scan
    /// of remaining files.
    pub async fn scan_once(&self) -> Result<()> {
        if !self.config.log_root.exists() {
            debug!(
                "Log root does not exist yet: {}",
                self.config.log_root.display()
            );
            return Ok(());
        }

        let mut pending = 0usize;

        for entry in fs::read_dir(&self.config.log_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Staging directories are in-progress rotations; the dead-letter
            // directory is an operator concern.
            if name.starts_with('.') || name == DEADLETTER_DIR {
                continue;
            }

            let folder = entry.path();
            debug!("Inspecting folder: {}", folder.display());

            for file in fs::read_dir(&folder)? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                    continue;
                }
                if !self.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if !self.promote_file(&path).await {
                    pending += 1;
                }
            }

            remove_if_empty(&folder);
        }

        gauge!("promotion_pending_files").set(pending as f64);
        Ok(())
    }

    /// Promote one file; returns `true` when it was removed locally.
    async fn promote_file(&self, path: &Path) -> bool {
        info!("Promoting {}", path.display());

        match self.pipeline.promote(path).await {
            Ok(results) if all_inserted(&results) => {
                counter!("promotion_files_total", "result" => "success").increment(1);
                self.failures.lock().remove(path);
                match fs::remove_file(path) {
                    Ok(()) => info!("Promoted and removed {}", path.display()),
                    // The file will be re-promoted next cycle; the engine
                    // receives a fresh insert, which at-least-once allows.
                    Err(e) => warn!(
                        "Promoted {} but could not remove it: {e}",
                        path.display()
                    ),
                }
                true
            }
            Ok(results) => {
                let failed: Vec<String> = results
                    .iter()
                    .filter(|r| !r.inserted)
                    .map(|r| {
                        format!(
                            "{}: {}",
                            r.source_id,
                            r.error.as_deref().unwrap_or("not inserted")
                        )
                    })
                    .collect();
                error!(
                    "Promotion incomplete for {} ({}/{} sources failed): {}",
                    path.display(),
                    failed.len(),
                    results.len(),
                    failed.join("; ")
                );
                self.record_failure(path);
                false
            }
            Err(e) => {
                error!("Promotion failed for {}: {e}", path.display());
                self.record_failure(path);
                false
            }
        }
    }

    /// Count a failure and dead-letter the file once the budget is spent.
    fn record_failure(&self, path: &Path) {
        counter!("promotion_files_total", "result" => "failure").increment(1);

        let attempts = {
            let mut failures = self.failures.lock();
            let count = failures.entry(path.to_path_buf()).or_insert(0);
            *count += 1;
            *count
        };

        if attempts < self.config.max_file_attempts {
            warn!(
                "Will retry {} next cycle (attempt {}/{})",
                path.display(),
                attempts,
                self.config.max_file_attempts
            );
            return;
        }

        self.failures.lock().remove(path);
        match self.deadletter(path) {
            Ok(dest) => {
                counter!("promotion_deadletter_total").increment(1);
                warn!(
                    "Moved {} to dead-letter after {attempts} failed attempts: {}",
                    path.display(),
                    dest.display()
                );
            }
            Err(e) => warn!(
                "Could not dead-letter {} ({e}); it will keep retrying",
                path.display()
            ),
        }
    }

    /// Move a file into the dead-letter directory, prefixing the batch
    /// folder name to keep filenames unique.
    fn deadletter(&self, path: &Path) -> Result<PathBuf> {
        let dead_dir = self.config.log_root.join(DEADLETTER_DIR);
        fs::create_dir_all(&dead_dir)?;

        let folder = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed.csv".to_string());

        let dest = dead_dir.join(format!("{folder}__{file}"));
        fs::rename(path, &dest)?;
        Ok(dest)
    }
}

/// Remove a batch folder once every file in it has been promoted.
fn remove_if_empty(folder: &Path) {
    let empty = fs::read_dir(folder)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        if let Err(e) = fs::remove_dir(folder) {
            debug!("Could not remove empty folder {}: {e}", folder.display());
        } else {
            debug!("Removed empty batch folder {}", folder.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    /// Scripted promoter: filenames containing "fail" fail wholesale,
    /// filenames containing "mixed" succeed for one source and fail for
    /// another, everything else succeeds.
    struct ScriptedPromoter;

    fn result(source: &str, inserted: bool) -> PromotionResult {
        PromotionResult {
            source_id: source.to_string(),
            target_table: source.to_string(),
            uploaded_object: inserted.then(|| format!("data/{source}/x.parquet")),
            inserted,
            error: (!inserted).then(|| "upload: connection refused".to_string()),
        }
    }

    impl Promoter for ScriptedPromoter {
        async fn promote(&self, path: &Path) -> Result<Vec<PromotionResult>> {
            let name = path.file_name().unwrap().to_string_lossy();
            if name.contains("fail") {
                Err(Error::Conversion("scripted failure".to_string()))
            } else if name.contains("mixed") {
                Ok(vec![result("ITU-693", false), result("ITU-694", true)])
            } else {
                Ok(vec![result("ITU-693", true)])
            }
        }
    }

    fn test_uploader(root: &Path, max_attempts: u32) -> PromotionUploader<ScriptedPromoter> {
        PromotionUploader::new(
            UploaderConfig {
                log_root: root.to_path_buf(),
                poll_interval: Duration::from_millis(10),
                max_file_attempts: max_attempts,
            },
            ScriptedPromoter,
            Arc::new(AtomicBool::new(true)),
        )
    }

    fn batch_file(root: &Path, folder: &str, name: &str) -> PathBuf {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, "id,timestamp,source_id,metric_name,value\n").unwrap();
        path
    }

    #[tokio::test]
    async fn test_successful_file_is_removed() {
        let tmp = TempDir::new().unwrap();
        let path = batch_file(tmp.path(), "mqtt_log_1", "ITU-693_1.csv");

        test_uploader(tmp.path(), 5).scan_once().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failing_file_is_retained() {
        let tmp = TempDir::new().unwrap();
        let path = batch_file(tmp.path(), "mqtt_log_1", "fail_1.csv");

        test_uploader(tmp.path(), 5).scan_once().await.unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_mixed_results_retain_file() {
        // One source failed, one succeeded: the file must stay for retry.
        let tmp = TempDir::new().unwrap();
        let path = batch_file(tmp.path(), "mqtt_log_1", "mixed_1.csv");

        test_uploader(tmp.path(), 5).scan_once().await.unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_scan() {
        let tmp = TempDir::new().unwrap();
        let failing = batch_file(tmp.path(), "mqtt_log_1", "fail_1.csv");
        let healthy = batch_file(tmp.path(), "mqtt_log_2", "ITU-693_2.csv");

        test_uploader(tmp.path(), 5).scan_once().await.unwrap();

        assert!(failing.exists());
        assert!(!healthy.exists());
    }

    #[tokio::test]
    async fn test_deadletter_after_max_attempts() {
        let tmp = TempDir::new().unwrap();
        let path = batch_file(tmp.path(), "mqtt_log_1", "fail_1.csv");
        let uploader = test_uploader(tmp.path(), 2);

        uploader.scan_once().await.unwrap();
        assert!(path.exists());

        uploader.scan_once().await.unwrap();
        assert!(!path.exists());

        let dead = tmp.path().join(DEADLETTER_DIR).join("mqtt_log_1__fail_1.csv");
        assert!(dead.exists());
    }

    #[tokio::test]
    async fn test_deadletter_not_rescanned() {
        let tmp = TempDir::new().unwrap();
        batch_file(tmp.path(), "mqtt_log_1", "fail_1.csv");
        let uploader = test_uploader(tmp.path(), 1);

        uploader.scan_once().await.unwrap();
        // The dead-lettered file would fail again if scanned; three more
        // scans must not touch it.
        uploader.scan_once().await.unwrap();
        uploader.scan_once().await.unwrap();

        let dead = tmp.path().join(DEADLETTER_DIR).join("mqtt_log_1__fail_1.csv");
        assert!(dead.exists());
    }

    #[tokio::test]
    async fn test_staging_and_non_csv_skipped() {
        let tmp = TempDir::new().unwrap();
        let staging = batch_file(tmp.path(), ".staging-mqtt_log_1", "ITU-693_1.csv");
        let dir = tmp.path().join("mqtt_log_2");
        fs::create_dir_all(&dir).unwrap();
        let other = dir.join("notes.txt");
        fs::write(&other, "not a batch file").unwrap();

        test_uploader(tmp.path(), 5).scan_once().await.unwrap();

        assert!(staging.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_empty_folder_cleaned_up() {
        let tmp = TempDir::new().unwrap();
        batch_file(tmp.path(), "mqtt_log_1", "ITU-693_1.csv");

        test_uploader(tmp.path(), 5).scan_once().await.unwrap();

        assert!(!tmp.path().join("mqtt_log_1").exists());
    }

    #[tokio::test]
    async fn test_missing_log_root_is_noop() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nowhere");
        let uploader = PromotionUploader::new(
            UploaderConfig {
                log_root: missing,
                ..Default::default()
            },
            ScriptedPromoter,
            Arc::new(AtomicBool::new(true)),
        );
        uploader.scan_once().await.unwrap();
    }
}
