//! CSV to Parquet conversion for lakehouse intake.
//!
//! Reads a rotation CSV, appends an ingestion timestamp and the unprocessed
//! flag, and writes a Snappy-compressed Parquet file. Every CSV column is
//! carried as text; the insert statements cast to the table's column types,
//! so a stray non-numeric value fails the engine job instead of the
//! conversion.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::error::{Error, Result};

/// Format of the `ingestion_timestamp` column value.
const INGESTION_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Convert `csv_path` into a Parquet file at `parquet_path`.
///
/// Fails with [`Error::Conversion`] when the CSV has no data rows; a file
/// without rows has nothing to promote.
pub fn convert_to_parquet(csv_path: &Path, parquet_path: &Path) -> Result<()> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let headers = reader.headers()?.clone();

    let mut columns: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    let mut rows = 0usize;
    for record in reader.records() {
        let record = record?;
        for (i, field) in record.iter().enumerate() {
            if let Some(column) = columns.get_mut(i) {
                column.push(field.to_string());
            }
        }
        rows += 1;
    }

    if rows == 0 {
        return Err(Error::Conversion(format!(
            "{} contains no data rows",
            csv_path.display()
        )));
    }

    let ingestion = Utc::now().format(INGESTION_TIMESTAMP_FORMAT).to_string();

    let mut fields: Vec<Field> = headers
        .iter()
        .map(|h| Field::new(h, DataType::Utf8, false))
        .collect();
    fields.push(Field::new("ingestion_timestamp", DataType::Utf8, false));
    fields.push(Field::new("processed", DataType::Boolean, false));
    let schema = Arc::new(Schema::new(fields));

    let mut arrays: Vec<ArrayRef> = columns
        .into_iter()
        .map(|c| Arc::new(StringArray::from(c)) as ArrayRef)
        .collect();
    arrays.push(Arc::new(StringArray::from(vec![ingestion; rows])));
    arrays.push(Arc::new(BooleanArray::from(vec![false; rows])));

    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let file = File::create(parquet_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    let csv_size = std::fs::metadata(csv_path)?.len();
    let parquet_size = std::fs::metadata(parquet_path)?.len();
    debug!(
        "Converted {} ({} rows): {} -> {} bytes",
        csv_path.display(),
        rows,
        csv_size,
        parquet_size
    );

    Ok(())
}
