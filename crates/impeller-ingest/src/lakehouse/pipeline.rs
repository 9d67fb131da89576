//! Per-file materialization pipeline.
//!
//! Each rotated CSV moves through a fixed sequence of stages:
//!
//! ```text
//! extract sources -> split per source -> convert -> upload -> ensure table -> insert
//! ```
//!
//! The table kind is decided once at intake and threaded through every
//! stage. After the split, sources are independent artifacts: one source's
//! failure is captured in its [`PromotionResult`] and the remaining sources
//! proceed. Overall file success requires every source's insert to succeed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use impeller_core::SourceRegistry;

use super::convert::convert_to_parquet;
use super::engine::QueryEngineClient;
use super::store::ObjectStoreClient;
use super::table::{TableManager, RAW_TABLE_NAME};
use crate::error::{Error, Result};

/// Target schema of a promoted file, decided once at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Structured per-source pump metrics.
    PumpMetrics,

    /// Unstructured raw broker logs.
    RawLog,
}

impl TableKind {
    /// Classify a file by its name.
    ///
    /// Files beginning with a registered source id are pump-metric files;
    /// a `raw` marker selects the raw-log shape; everything else defaults
    /// to pump metrics, matching the intake of legacy batches.
    pub fn for_file(path: &Path, registry: &SourceRegistry) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        if registry.sources().iter().any(|s| stem.starts_with(s.as_str())) {
            TableKind::PumpMetrics
        } else if stem.to_ascii_lowercase().contains("raw") {
            TableKind::RawLog
        } else {
            TableKind::PumpMetrics
        }
    }

    /// Target table name for a source under this kind.
    ///
    /// Raw logs share one table to avoid a schema clash with the per-source
    /// metric tables.
    pub fn target_table(&self, source_id: &str) -> String {
        match self {
            TableKind::PumpMetrics => source_id.to_string(),
            TableKind::RawLog => RAW_TABLE_NAME.to_string(),
        }
    }
}

/// Outcome of promoting one source out of one file.
#[derive(Debug, Clone)]
pub struct PromotionResult {
    /// The source this result belongs to.
    pub source_id: String,

    /// The table the insert targeted (or would have targeted).
    pub target_table: String,

    /// Object key of the uploaded Parquet file, once the upload succeeded.
    pub uploaded_object: Option<String>,

    /// Whether the insert was confirmed.
    pub inserted: bool,

    /// Failure description, when any stage failed.
    pub error: Option<String>,
}

impl PromotionResult {
    fn pending(source_id: &str, target_table: String) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_table,
            uploaded_object: None,
            inserted: false,
            error: None,
        }
    }

    fn failed(source_id: &str, target_table: String, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::pending(source_id, target_table)
        }
    }
}

/// Whether every per-source result confirmed its insert.
pub fn all_inserted(results: &[PromotionResult]) -> bool {
    !results.is_empty() && results.iter().all(|r| r.inserted)
}

/// Named accessor strategies for determining a file's sources, evaluated
/// in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractStrategy {
    /// Distinct values of a dedicated `source_id` column.
    SourceColumn,

    /// Registered identifiers substring-matched against a `topic` column.
    KnownInTopic,

    /// Identifier-shaped tokens found in a `topic` column.
    FallbackPattern,
}

const EXTRACT_ORDER: [ExtractStrategy; 3] = [
    ExtractStrategy::SourceColumn,
    ExtractStrategy::KnownInTopic,
    ExtractStrategy::FallbackPattern,
];

/// A rotated CSV loaded into memory for splitting.
struct CsvRows {
    headers: csv::StringRecord,
    records: Vec<csv::StringRecord>,
}

impl CsvRows {
    fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let records = reader.records().collect::<std::result::Result<_, _>>()?;
        Ok(Self { headers, records })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// One source's slice of a file, ready for conversion.
struct SourceSplit {
    source_id: String,
    csv_path: PathBuf,
}

/// The materialization pipeline.
pub struct MaterializationPipeline {
    registry: SourceRegistry,
    store: ObjectStoreClient,
    engine: Arc<QueryEngineClient>,
    tables: TableManager,
}

impl MaterializationPipeline {
    /// Assemble the pipeline from its collaborators.
    pub fn new(
        registry: SourceRegistry,
        store: ObjectStoreClient,
        engine: Arc<QueryEngineClient>,
    ) -> Self {
        let tables = TableManager::new(
            Arc::clone(&engine),
            store.bucket().to_string(),
            store.folder().to_string(),
        );
        Self {
            registry,
            store,
            engine,
            tables,
        }
    }

    /// Promote one rotated CSV into the lakehouse.
    ///
    /// Returns one [`PromotionResult`] per source found in the file. An
    /// error return means the file as a whole could not enter the pipeline
    /// (unreadable, no sources, engine auth failure); the caller retains
    /// the file for retry either way.
    pub async fn process_file(&self, path: &Path) -> Result<Vec<PromotionResult>> {
        let kind = TableKind::for_file(path, &self.registry);
        debug!("Intake {} as {:?}", path.display(), kind);

        let rows = CsvRows::read(path)?;
        let sources = self.extract_sources(&rows)?;
        info!(
            "File {} references {} source(s): {:?}",
            path.display(),
            sources.len(),
            sources
        );

        let temp = tempfile::tempdir()?;
        let (splits, mut results) = self.split_per_source(&rows, &sources, temp.path(), kind)?;

        if !self.engine.is_authenticated() {
            self.engine.authenticate().await?;
        }

        for split in &splits {
            results.push(self.promote_source(split, kind).await);
        }

        Ok(results)
    }

    /// Determine the sources referenced by the file.
    ///
    /// Strategies run in priority order; the first one yielding at least
    /// one identifier wins. All failing fails the whole file.
    fn extract_sources(&self, rows: &CsvRows) -> Result<Vec<String>> {
        for strategy in EXTRACT_ORDER {
            let found = self.apply_strategy(strategy, rows);
            if !found.is_empty() {
                debug!("Sources resolved via {:?}: {:?}", strategy, found);
                return Ok(found);
            }
        }
        Err(Error::Conversion(
            "no source identifier could be determined from any column".to_string(),
        ))
    }

    fn apply_strategy(&self, strategy: ExtractStrategy, rows: &CsvRows) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut push_unique = |id: String| {
            if !found.contains(&id) {
                found.push(id);
            }
        };

        match strategy {
            ExtractStrategy::SourceColumn => {
                if let Some(idx) = rows.column("source_id") {
                    for record in &rows.records {
                        if let Some(value) = record.get(idx) {
                            if !value.is_empty() {
                                push_unique(value.to_string());
                            }
                        }
                    }
                }
            }
            ExtractStrategy::KnownInTopic => {
                if let Some(idx) = rows.column("topic") {
                    for record in &rows.records {
                        if let Some(topic) = record.get(idx) {
                            for id in self.registry.known_in(topic) {
                                push_unique(id.to_string());
                            }
                        }
                    }
                }
            }
            ExtractStrategy::FallbackPattern => {
                if let Some(idx) = rows.column("topic") {
                    for record in &rows.records {
                        if let Some(topic) = record.get(idx) {
                            for id in SourceRegistry::fallback_in(topic) {
                                push_unique(id);
                            }
                        }
                    }
                }
            }
        }

        found
    }

    /// Partition rows by source into independent per-source CSV files.
    ///
    /// A source with zero matching rows is reported failed immediately
    /// without affecting the others.
    fn split_per_source(
        &self,
        rows: &CsvRows,
        sources: &[String],
        dir: &Path,
        kind: TableKind,
    ) -> Result<(Vec<SourceSplit>, Vec<PromotionResult>)> {
        let source_idx = rows.column("source_id");
        let topic_idx = rows.column("topic");

        let mut splits = Vec::new();
        let mut failed = Vec::new();

        for source in sources {
            let matching: Vec<&csv::StringRecord> = rows
                .records
                .iter()
                .filter(|record| match (source_idx, topic_idx) {
                    (Some(idx), _) => record.get(idx) == Some(source.as_str()),
                    (None, Some(idx)) => record
                        .get(idx)
                        .is_some_and(|topic| topic.contains(source.as_str())),
                    (None, None) => true,
                })
                .collect();

            if matching.is_empty() {
                warn!("No rows found for source {source}; skipping");
                failed.push(PromotionResult::failed(
                    source,
                    kind.target_table(source),
                    "no rows for source".to_string(),
                ));
                continue;
            }

            let csv_path = dir.join(format!("{source}.csv"));
            let mut writer = csv::Writer::from_path(&csv_path)?;
            writer.write_record(&rows.headers)?;
            for record in matching {
                writer.write_record(record)?;
            }
            writer.flush()?;

            splits.push(SourceSplit {
                source_id: source.clone(),
                csv_path,
            });
        }

        Ok((splits, failed))
    }

    /// Run one source through convert, upload, ensure-table and insert.
    ///
    /// Never returns an error: every failure is captured in the result so
    /// sibling sources are unaffected.
    async fn promote_source(&self, split: &SourceSplit, kind: TableKind) -> PromotionResult {
        let target_table = kind.target_table(&split.source_id);
        let mut result = PromotionResult::pending(&split.source_id, target_table.clone());

        let unique = unique_filename(&split.csv_path);
        let parquet_path = split.csv_path.with_file_name(&unique);

        if let Err(e) = convert_to_parquet(&split.csv_path, &parquet_path) {
            warn!("Conversion failed for {}: {e}", split.source_id);
            result.error = Some(format!("conversion: {e}"));
            return result;
        }

        let key = self.store.object_key(&split.source_id, &unique);
        if let Err(e) = self.store.upload(&parquet_path, &key).await {
            warn!("Upload failed for {}: {e}", split.source_id);
            result.error = Some(format!("upload: {e}"));
            return result;
        }
        result.uploaded_object = Some(key);

        if let Err(e) = self.tables.ensure_table(&target_table, kind).await {
            warn!("Table provisioning failed for {}: {e}", split.source_id);
            result.error = Some(format!("ensure table: {e}"));
            return result;
        }

        if let Err(e) = self
            .tables
            .insert_from(&target_table, kind, &split.source_id, &unique)
            .await
        {
            warn!("Insert failed for {}: {e}", split.source_id);
            result.error = Some(format!("insert: {e}"));
            return result;
        }

        result.inserted = true;

        // The insert is confirmed; this source's local artifacts are done.
        let _ = fs::remove_file(&parquet_path);
        let _ = fs::remove_file(&split.csv_path);

        info!(
            "Source {} promoted into '{}'",
            split.source_id, result.target_table
        );
        result
    }
}

/// Build a timestamped Parquet filename from a CSV path.
fn unique_filename(csv_path: &Path) -> String {
    let stem = csv_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    format!("{stem}_{}.parquet", Utc::now().format("%Y%m%d_%H%M%S"))
}
