//! Buffer and time-based rotation log.
//!
//! This module provides the [`RotationLog`], the shared buffer between the
//! broker listener and the promotion uploader. Records accumulate in memory
//! and are flushed to a timestamped batch folder when the rotation interval
//! elapses (or on demand at shutdown).
//!
//! # Batch Layout
//!
//! Each rotation produces one folder under the log root:
//!
//! ```text
//! <log_root>/<prefix>_<timestamp>/raw_<timestamp>.csv
//! <log_root>/<prefix>_<timestamp>/<source>_<timestamp>.csv   (per source)
//! ```
//!
//! The raw file holds every buffered record in arrival order and is the
//! durable source of truth. Structured files hold only the records that
//! decomposed cleanly and belong to a registered source.
//!
//! # Atomicity
//!
//! Rotation takes the whole buffer in a single lock acquisition, writes the
//! batch into a hidden staging directory, and renames it into place. The
//! uploader only ever observes complete batches. If any write fails, the
//! records are restored to the front of the buffer and the staging directory
//! is discarded.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use impeller_core::{ParsedRecord, RawRecord, SourceRegistry};

use crate::error::Result;

/// Column set of the raw rotation file.
const RAW_COLUMNS: [&str; 5] = ["timestamp", "topic", "payload", "qos", "retain"];

/// Column set of the per-source structured files.
const STRUCTURED_COLUMNS: [&str; 5] = ["id", "timestamp", "source_id", "metric_name", "value"];

/// Configuration for the rotation log.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Root directory batches are written under.
    pub log_root: PathBuf,

    /// Time between rotations.
    /// Default: 10 minutes.
    pub interval: Duration,

    /// Prefix for batch folder names.
    /// Default: "mqtt_log"
    pub folder_prefix: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("./logs"),
            interval: Duration::from_secs(10 * 60),
            folder_prefix: "mqtt_log".to_string(),
        }
    }
}

/// A sealed batch of rotated files.
///
/// Created once per rotation, never written to again; consumed exactly once
/// by the promotion uploader (via the filesystem).
#[derive(Debug, Clone)]
pub struct RotationBatch {
    /// The batch folder.
    pub folder: PathBuf,

    /// Path of the raw file inside the folder.
    pub raw_file: PathBuf,

    /// `(source_id, path)` for each structured file written.
    pub structured_files: Vec<(String, PathBuf)>,

    /// Number of raw records flushed into this batch.
    pub record_count: usize,
}

/// Shared buffer with time-based rotation into CSV batches.
///
/// Thread-safe: the listener appends while rotation takes-and-clears, each
/// under a single lock acquisition.
pub struct RotationLog {
    config: RotationConfig,
    registry: SourceRegistry,
    buffer: Mutex<Vec<RawRecord>>,
    last_rotation: Mutex<Instant>,
    total_records: AtomicUsize,
    total_batches: AtomicUsize,
}

impl RotationLog {
    /// Create a new rotation log, creating the log root if needed.
    pub fn new(config: RotationConfig, registry: SourceRegistry) -> Result<Self> {
        fs::create_dir_all(&config.log_root)?;

        info!(
            "RotationLog initialized: root={}, interval={:?}",
            config.log_root.display(),
            config.interval
        );

        Ok(Self {
            config,
            registry,
            buffer: Mutex::new(Vec::new()),
            last_rotation: Mutex::new(Instant::now()),
            total_records: AtomicUsize::new(0),
            total_batches: AtomicUsize::new(0),
        })
    }

    /// Append a record to the buffer.
    pub fn append(&self, record: RawRecord) {
        let mut buffer = self.buffer.lock();
        buffer.push(record);
        gauge!("buffer_records").set(buffer.len() as f64);
    }

    /// Number of records currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Total records flushed across all batches.
    pub fn total_records(&self) -> usize {
        self.total_records.load(Ordering::Relaxed)
    }

    /// Total batches written.
    pub fn total_batches(&self) -> usize {
        self.total_batches.load(Ordering::Relaxed)
    }

    /// Rotate if the configured interval has elapsed.
    ///
    /// Returns the batch if one was written. Rotation with an empty buffer
    /// is a no-op: no folder is created and no result is returned.
    pub fn check_rotation(&self) -> Result<Option<RotationBatch>> {
        let due = self.last_rotation.lock().elapsed() >= self.config.interval;
        if !due {
            return Ok(None);
        }
        self.rotate_now()
    }

    /// Rotate immediately, regardless of elapsed time.
    ///
    /// Used at shutdown to flush whatever is buffered.
    pub fn rotate_now(&self) -> Result<Option<RotationBatch>> {
        // Atomic take-all-and-clear: nothing appended after this point
        // belongs to this batch.
        let records = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };

        if records.is_empty() {
            debug!("Buffer empty, skipping rotation");
            return Ok(None);
        }
        gauge!("buffer_records").set(0.0);

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let name = format!("{}_{}", self.config.folder_prefix, timestamp);
        let staging = self.config.log_root.join(format!(".staging-{name}"));
        let final_dir = self.config.log_root.join(&name);

        fs::create_dir_all(&staging)?;

        match self.write_batch(&staging, &timestamp, &records) {
            Ok((raw_name, structured)) => {
                fs::rename(&staging, &final_dir)?;
                *self.last_rotation.lock() = Instant::now();

                self.total_records.fetch_add(records.len(), Ordering::Relaxed);
                self.total_batches.fetch_add(1, Ordering::Relaxed);
                counter!("rotation_batches_total").increment(1);
                counter!("rotation_records_total").increment(records.len() as u64);

                info!(
                    "Rotated {} records into {} ({} structured files)",
                    records.len(),
                    final_dir.display(),
                    structured.len()
                );

                Ok(Some(RotationBatch {
                    raw_file: final_dir.join(raw_name),
                    structured_files: structured
                        .into_iter()
                        .map(|(source, file)| (source, final_dir.join(file)))
                        .collect(),
                    folder: final_dir,
                    record_count: records.len(),
                }))
            }
            Err(e) => {
                // Put the records back at the front so nothing is lost and
                // arrival order is preserved for the next attempt.
                {
                    let mut buffer = self.buffer.lock();
                    let mut restored = records;
                    restored.append(&mut buffer);
                    *buffer = restored;
                    gauge!("buffer_records").set(buffer.len() as f64);
                }
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    /// Write the raw file and the per-source structured files into `dir`.
    ///
    /// A structured-file write failure is logged and skipped; it does not
    /// affect the raw file or other sources. A raw-file failure aborts the
    /// whole batch.
    fn write_batch(
        &self,
        dir: &Path,
        timestamp: &str,
        records: &[RawRecord],
    ) -> Result<(PathBuf, Vec<(String, PathBuf)>)> {
        let raw_name = PathBuf::from(format!("raw_{timestamp}.csv"));
        write_raw_csv(&dir.join(&raw_name), records)?;

        let grouped = self.group_by_source(records);

        let mut structured = Vec::new();
        for (source, rows) in grouped {
            let file_name = PathBuf::from(format!("{source}_{timestamp}.csv"));
            match write_structured_csv(&dir.join(&file_name), &rows) {
                Ok(()) => structured.push((source.to_string(), file_name)),
                Err(e) => {
                    warn!("Skipping structured file for {source}: {e}");
                    counter!("rotation_write_failures_total").increment(1);
                }
            }
        }

        Ok((raw_name, structured))
    }

    /// Decompose records and group them by registered source.
    ///
    /// Records that fail decomposition or belong to an unregistered source
    /// are dropped here; they remain in the raw file.
    fn group_by_source<'a>(&'a self, records: &[RawRecord]) -> BTreeMap<&'a str, Vec<ParsedRecord>> {
        let mut grouped: BTreeMap<&str, Vec<ParsedRecord>> = BTreeMap::new();
        let mut drops = 0u64;

        for record in records {
            match record.parse() {
                Ok(parsed) => match self.registry.classify(&parsed.source_id) {
                    Some(source) => grouped.entry(source).or_default().push(parsed),
                    None => {
                        debug!(
                            "No structured output for unregistered source '{}'",
                            parsed.source_id
                        );
                    }
                },
                Err(e) => {
                    drops += 1;
                    debug!("Dropping record on topic '{}' from structured output: {e}", record.topic);
                }
            }
        }

        if drops > 0 {
            counter!("rotation_parse_drops_total").increment(drops);
        }

        grouped
    }
}

/// Write the raw file: every record, arrival order, fixed column set.
fn write_raw_csv(path: &Path, records: &[RawRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(RAW_COLUMNS)?;
    for record in records {
        writer.write_record([
            record.captured_at.to_rfc3339(),
            record.topic.clone(),
            record.payload.clone(),
            record.qos.to_string(),
            record.retain.to_string(),
        ])?;
    }
    writer.flush()?;
    debug!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}

/// Write one structured file for a single source.
fn write_structured_csv(path: &Path, rows: &[ParsedRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(STRUCTURED_COLUMNS)?;
    for (id, row) in rows.iter().enumerate() {
        writer.write_record([
            id.to_string(),
            row.captured_at.to_rfc3339(),
            row.source_id.clone(),
            row.metric_name.clone(),
            row.value.clone(),
        ])?;
    }
    writer.flush()?;
    debug!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_log(root: &Path) -> RotationLog {
        let config = RotationConfig {
            log_root: root.to_path_buf(),
            ..Default::default()
        };
        RotationLog::new(config, SourceRegistry::default()).unwrap()
    }

    fn record(topic: &str, payload: &str) -> RawRecord {
        RawRecord {
            captured_at: Utc::now(),
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: 0,
            retain: false,
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn test_empty_buffer_rotation_is_noop() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        assert!(log.rotate_now().unwrap().is_none());
        // No folders created.
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_repeated_idle_checks_create_nothing() {
        let tmp = TempDir::new().unwrap();
        let config = RotationConfig {
            log_root: tmp.path().to_path_buf(),
            interval: Duration::from_millis(1),
            ..Default::default()
        };
        let log = RotationLog::new(config, SourceRegistry::default()).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(log.check_rotation().unwrap().is_none());
        std::thread::sleep(Duration::from_millis(5));
        assert!(log.check_rotation().unwrap().is_none());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_raw_file_holds_all_records_in_order() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        log.append(record("sensors/ITU-693/EngRPM", r#"{"ITU-693":{"P1":{"RPM":1500}}}"#));
        log.append(record("junk", "not json"));
        log.append(record("sensors/ITU-999/X", r#"{"ITU-999":{"P1":{"T":3}}}"#));

        let batch = log.rotate_now().unwrap().unwrap();
        assert_eq!(batch.record_count, 3);

        let lines = read_lines(&batch.raw_file);
        assert_eq!(lines.len(), 4); // header + 3 records
        assert!(lines[1].contains("sensors/ITU-693/EngRPM"));
        assert!(lines[2].contains("junk"));
        assert!(lines[3].contains("sensors/ITU-999/X"));
    }

    #[test]
    fn test_scenario_single_source_structured_row() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        log.append(record("sensors/ITU-693/EngRPM", r#"{"ITU-693":{"P1":{"RPM":1500}}}"#));

        let batch = log.rotate_now().unwrap().unwrap();
        assert_eq!(batch.structured_files.len(), 1);
        let (source, path) = &batch.structured_files[0];
        assert_eq!(source, "ITU-693");

        let lines = read_lines(path);
        assert_eq!(lines[0], "id,timestamp,source_id,metric_name,value");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("ITU-693"));
        assert!(lines[1].contains("RPM"));
        assert!(lines[1].ends_with(",1500"));
    }

    #[test]
    fn test_two_sources_two_structured_files() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        log.append(record("sensors/ITU-693/EngRPM", r#"{"ITU-693":{"P1":{"RPM":1500}}}"#));
        log.append(record("sensors/ITU-694/EngRPM", r#"{"ITU-694":{"P1":{"RPM":900}}}"#));
        log.append(record("sensors/ITU-693/OilPress", r#"{"ITU-693":{"P1":{"PSI":40}}}"#));

        let batch = log.rotate_now().unwrap().unwrap();

        let sources: Vec<&str> = batch
            .structured_files
            .iter()
            .map(|(s, _)| s.as_str())
            .collect();
        assert_eq!(sources, vec!["ITU-693", "ITU-694"]);

        // Each file holds only its own source's rows.
        let (_, path_693) = &batch.structured_files[0];
        let lines = read_lines(path_693);
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines.iter().skip(1).all(|l| l.contains("ITU-693")));

        let (_, path_694) = &batch.structured_files[1];
        assert_eq!(read_lines(path_694).len(), 2);

        // One raw file holds all records.
        assert_eq!(read_lines(&batch.raw_file).len(), 4);
    }

    #[test]
    fn test_malformed_records_raw_only() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        // Short topic, bad payload, unregistered source: none reach
        // structured output.
        log.append(record("heartbeat", r#"{"ITU-693":{"P1":{"RPM":1}}}"#));
        log.append(record("sensors/ITU-693/EngRPM", "ONLINE"));
        log.append(record("sensors/ITU-999/X", r#"{"ITU-999":{"P1":{"T":3}}}"#));

        let batch = log.rotate_now().unwrap().unwrap();
        assert!(batch.structured_files.is_empty());
        assert_eq!(read_lines(&batch.raw_file).len(), 4);
    }

    #[test]
    fn test_buffer_cleared_after_rotation() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        log.append(record("sensors/ITU-693/EngRPM", r#"{"ITU-693":{"P1":{"RPM":1}}}"#));
        assert_eq!(log.buffered(), 1);

        log.rotate_now().unwrap().unwrap();
        assert_eq!(log.buffered(), 0);

        // A second rotation right after has nothing to do.
        assert!(log.rotate_now().unwrap().is_none());
    }

    #[test]
    fn test_no_staging_dirs_left_behind() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        log.append(record("sensors/ITU-693/EngRPM", r#"{"ITU-693":{"P1":{"RPM":1}}}"#));
        log.rotate_now().unwrap().unwrap();

        for entry in fs::read_dir(tmp.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().starts_with('.'));
        }
    }

    #[test]
    fn test_interval_gates_check_rotation() {
        let tmp = TempDir::new().unwrap();
        let config = RotationConfig {
            log_root: tmp.path().to_path_buf(),
            interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let log = RotationLog::new(config, SourceRegistry::default()).unwrap();

        log.append(record("sensors/ITU-693/EngRPM", r#"{"ITU-693":{"P1":{"RPM":1}}}"#));
        // Interval has not elapsed: no rotation even with a non-empty buffer.
        assert!(log.check_rotation().unwrap().is_none());
        assert_eq!(log.buffered(), 1);
    }
}
