//! Lakehouse table management and SQL templates.
//!
//! Two fixed table shapes exist: the per-source pump-metric table and one
//! shared raw-log table. Both are partitioned by month of the derived
//! `timestamp_date` column. Tables are created lazily on first promotion
//! and never dropped.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use super::engine::QueryEngineClient;
use super::pipeline::TableKind;
use crate::error::{Error, Result};

/// Shared table for promoted raw logs.
pub const RAW_TABLE_NAME: &str = "raw_logs";

/// Existence polls after issuing a create statement.
const MAX_TABLE_RETRIES: u32 = 3;

/// Delay between existence polls.
const TABLE_POLL_DELAY: Duration = Duration::from_secs(1);

/// Wait after a metadata refresh before the engine sees new files.
const METADATA_REFRESH_DELAY: Duration = Duration::from_secs(2);

/// Table manager bound to one engine connection.
pub struct TableManager {
    engine: Arc<QueryEngineClient>,
    bucket: String,
    folder: String,
}

impl TableManager {
    /// Create a manager for tables backed by `bucket`/`folder`.
    pub fn new(engine: Arc<QueryEngineClient>, bucket: String, folder: String) -> Self {
        Self {
            engine,
            bucket,
            folder,
        }
    }

    /// Fully-qualified Iceberg path of a managed table.
    fn iceberg_path(&self, table: &str) -> String {
        format!(r#"Iceberg.{b}.{b}."{table}""#, b = self.bucket)
    }

    /// Fully-qualified path of a source's uploaded Parquet file.
    fn external_path(&self, source_id: &str, filename: &str) -> String {
        format!(
            r#"{b}.{b}.{f}."{source_id}"."{filename}""#,
            b = self.bucket,
            f = self.folder
        )
    }

    /// CREATE TABLE statement for the given kind.
    fn create_statement(&self, table: &str, kind: TableKind) -> String {
        match kind {
            TableKind::PumpMetrics => format!(
                r#"CREATE TABLE {path} (
    "timestamp" VARCHAR,
    "ingestion_timestamp" VARCHAR,
    "timestamp_date" DATE,
    "source_id" VARCHAR,
    "metric_name" VARCHAR,
    "value" DOUBLE,
    "processed" BOOLEAN
)
PARTITION BY (MONTH("timestamp_date"))"#,
                path = self.iceberg_path(table)
            ),
            TableKind::RawLog => format!(
                r#"CREATE TABLE {path} (
    "timestamp" VARCHAR,
    "timestamp_date" DATE,
    "topic" VARCHAR,
    "payload" VARCHAR
)
PARTITION BY (MONTH("timestamp_date"))"#,
                path = self.iceberg_path(table)
            ),
        }
    }

    /// INSERT-from-external-path statement for the given kind.
    fn insert_statement(
        &self,
        table: &str,
        kind: TableKind,
        source_id: &str,
        filename: &str,
    ) -> String {
        let target = self.iceberg_path(table);
        let external = self.external_path(source_id, filename);
        match kind {
            TableKind::PumpMetrics => format!(
                r#"INSERT INTO {target}
SELECT
    CAST("timestamp" AS VARCHAR) AS "timestamp",
    CAST("ingestion_timestamp" AS VARCHAR) AS "ingestion_timestamp",
    CAST(SUBSTR(CAST("timestamp" AS VARCHAR), 1, 10) AS DATE) AS "timestamp_date",
    "source_id",
    "metric_name",
    CAST("value" AS DOUBLE) AS "value",
    CAST("processed" AS BOOLEAN) AS "processed"
FROM {external}"#
            ),
            TableKind::RawLog => format!(
                r#"INSERT INTO {target}
SELECT
    CAST("timestamp" AS VARCHAR) AS "timestamp",
    CAST(SUBSTR(CAST("timestamp" AS VARCHAR), 1, 10) AS DATE) AS "timestamp_date",
    CAST("topic" AS VARCHAR) AS "topic",
    CAST("payload" AS VARCHAR) AS "payload"
FROM {external}"#
            ),
        }
    }

    /// Whether the table currently exists.
    ///
    /// A probe query failure is read as "does not exist"; the engine has no
    /// cheaper existence check for reflected Iceberg tables.
    pub async fn table_exists(&self, table: &str) -> bool {
        let probe = format!("SELECT 1 FROM {} LIMIT 1", self.iceberg_path(table));
        match self.engine.execute(&probe).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Existence probe for '{table}': {e}");
                false
            }
        }
    }

    /// Ensure the table exists, creating it if missing.
    ///
    /// After a create, existence is polled a bounded number of times;
    /// exhaustion fails with [`Error::TableProvisioning`].
    pub async fn ensure_table(&self, table: &str, kind: TableKind) -> Result<()> {
        if self.table_exists(table).await {
            return Ok(());
        }

        info!("Table '{table}' missing, creating");
        if let Err(e) = self.engine.execute(&self.create_statement(table, kind)).await {
            // The create may race another promotion cycle; existence polling
            // below decides whether this mattered.
            warn!("Create table '{table}' reported: {e}");
        }

        for attempt in 1..=MAX_TABLE_RETRIES {
            if self.table_exists(table).await {
                counter!("lakehouse_tables_created_total").increment(1);
                info!("Table '{table}' is now available");
                return Ok(());
            }
            debug!("Waiting for table '{table}' (attempt {attempt}/{MAX_TABLE_RETRIES})");
            tokio::time::sleep(TABLE_POLL_DELAY).await;
        }

        Err(Error::TableProvisioning {
            table: table.to_string(),
            attempts: MAX_TABLE_RETRIES,
        })
    }

    /// Refresh the engine's metadata view of a source's folder.
    ///
    /// Failure is tolerated: the insert may still see the file if metadata
    /// was already fresh.
    pub async fn refresh_metadata(&self, source_id: &str) -> bool {
        let statement = format!(
            r#"ALTER TABLE {b}.{b}."{f}.{source_id}" REFRESH METADATA"#,
            b = self.bucket,
            f = self.folder
        );
        match self.engine.execute(&statement).await {
            Ok(_) => {
                debug!("Metadata refreshed for source folder {source_id}");
                true
            }
            Err(e) => {
                warn!("Metadata refresh failed for {source_id}: {e}; continuing");
                false
            }
        }
    }

    /// Log row count and time range of the uploaded file. Soft check only.
    async fn verify_source_data(&self, source_id: &str, filename: &str) {
        let query = format!(
            r#"SELECT COUNT(*) AS row_count, MIN("timestamp") AS min_ts, MAX("timestamp") AS max_ts FROM {}"#,
            self.external_path(source_id, filename)
        );
        match self.engine.execute(&query).await {
            Ok(body) => {
                if let Some(row) = body.get("rows").and_then(|r| r.get(0)) {
                    info!(
                        "Source data for {source_id}: rows={}, range={} .. {}",
                        row.get("row_count").unwrap_or(&serde_json::Value::Null),
                        row.get("min_ts").unwrap_or(&serde_json::Value::Null),
                        row.get("max_ts").unwrap_or(&serde_json::Value::Null)
                    );
                }
            }
            Err(e) => debug!("Source data verification failed: {e}"),
        }
    }

    /// Log the table's total row count after an insert. Soft check only.
    async fn verify_insert(&self, table: &str) {
        let query = format!(
            "SELECT COUNT(*) AS total_rows FROM {}",
            self.iceberg_path(table)
        );
        match self.engine.execute(&query).await {
            Ok(body) => {
                if let Some(total) = body
                    .get("rows")
                    .and_then(|r| r.get(0))
                    .and_then(|row| row.get("total_rows"))
                {
                    info!("Table '{table}' now holds {total} rows");
                }
            }
            Err(e) => debug!("Insert verification failed: {e}"),
        }
    }

    /// Insert an uploaded file into its target table.
    ///
    /// Refreshes metadata, waits for propagation, soft-verifies the source,
    /// then submits the insert job. An engine failure surfaces with the
    /// job's failure detail.
    pub async fn insert_from(
        &self,
        table: &str,
        kind: TableKind,
        source_id: &str,
        filename: &str,
    ) -> Result<()> {
        self.refresh_metadata(source_id).await;
        tokio::time::sleep(METADATA_REFRESH_DELAY).await;
        self.verify_source_data(source_id, filename).await;

        info!("Inserting '{filename}' into table '{table}'");
        self.engine
            .execute(&self.insert_statement(table, kind, source_id, filename))
            .await?;

        counter!("lakehouse_inserts_total").increment(1);
        self.verify_insert(table).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn test_manager() -> TableManager {
        let engine = Arc::new(
            QueryEngineClient::new(
                super::super::engine::QueryEngineConfig::default(),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap(),
        );
        TableManager::new(engine, "datalake".to_string(), "data".to_string())
    }

    #[test]
    fn test_pump_create_statement_shape() {
        let manager = test_manager();
        let sql = manager.create_statement("ITU-693", TableKind::PumpMetrics);
        assert!(sql.starts_with(r#"CREATE TABLE Iceberg.datalake.datalake."ITU-693""#));
        assert!(sql.contains(r#""source_id" VARCHAR"#));
        assert!(sql.contains(r#""metric_name" VARCHAR"#));
        assert!(sql.contains(r#""value" DOUBLE"#));
        assert!(sql.contains(r#""processed" BOOLEAN"#));
        assert!(sql.contains(r#"PARTITION BY (MONTH("timestamp_date"))"#));
    }

    #[test]
    fn test_raw_create_statement_shape() {
        let manager = test_manager();
        let sql = manager.create_statement(RAW_TABLE_NAME, TableKind::RawLog);
        assert!(sql.contains(r#""topic" VARCHAR"#));
        assert!(sql.contains(r#""payload" VARCHAR"#));
        assert!(!sql.contains("ingestion_timestamp"));
        assert!(sql.contains(r#"PARTITION BY (MONTH("timestamp_date"))"#));
    }

    #[test]
    fn test_insert_statement_paths() {
        let manager = test_manager();
        let sql = manager.insert_statement(
            "ITU-693",
            TableKind::PumpMetrics,
            "ITU-693",
            "ITU-693_20250101_120000.parquet",
        );
        assert!(sql.contains(r#"INSERT INTO Iceberg.datalake.datalake."ITU-693""#));
        assert!(sql.contains(r#"FROM datalake.datalake.data."ITU-693"."ITU-693_20250101_120000.parquet""#));
        assert!(sql.contains("SUBSTR"));
    }

    #[test]
    fn test_raw_insert_targets_shared_table() {
        let manager = test_manager();
        let sql = manager.insert_statement(
            RAW_TABLE_NAME,
            TableKind::RawLog,
            "ITU-694",
            "raw_20250101_120000.parquet",
        );
        assert!(sql.contains(r#"INSERT INTO Iceberg.datalake.datalake."raw_logs""#));
        assert!(sql.contains(r#""ITU-694"."raw_20250101_120000.parquet""#));
        assert!(!sql.contains("metric_name"));
    }
}
