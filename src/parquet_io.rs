//! Parquet row-group reader and output writers.
//!
//! Records are read one row-group at a time and converted to dynamic
//! [`DeviceRecord`]s: integer columns become integers, floating point
//! columns floats, booleans stay booleans, and every other Arrow type is
//! cast to text. Writes always go to a temporary file next to the target
//! and are renamed into place once the writer has closed.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    new_null_array, Array, ArrayRef, AsArray, BooleanBuilder, Float64Builder, Int64Builder,
    StringBuilder,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde_json::Value;

use crate::config::OutputConfig;
use crate::models::{value_to_text, DeviceRecord, OUTPUT_FIELDS};

/// An input file opened for row-group access.
#[derive(Debug, Clone)]
pub struct ParquetSource {
    path: PathBuf,
    schema: SchemaRef,
    num_row_groups: usize,
    num_rows: i64,
}

impl ParquetSource {
    /// Read the footer of `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("Not a readable parquet file: {}", path.display()))?;
        let metadata = builder.metadata();
        Ok(Self {
            path: path.to_path_buf(),
            schema: builder.schema().clone(),
            num_row_groups: metadata.num_row_groups(),
            num_rows: metadata.file_metadata().num_rows(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn num_row_groups(&self) -> usize {
        self.num_row_groups
    }

    pub fn num_rows(&self) -> i64 {
        self.num_rows
    }

    pub fn read_row_group_blocking(&self, index: usize) -> Result<Vec<DeviceRecord>> {
        if index >= self.num_row_groups {
            bail!(
                "row group {} out of range for {} ({} row groups)",
                index,
                self.path.display(),
                self.num_row_groups
            );
        }
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_row_groups(vec![index])
            .build()?;

        let mut records = Vec::new();
        for batch in reader {
            let batch = batch.with_context(|| {
                format!("Failed to read row group {} of {}", index, self.path.display())
            })?;
            records.extend(batch_to_records(&batch)?);
        }
        Ok(records)
    }

    /// Read one row-group on the blocking pool.
    pub async fn read_row_group(&self, index: usize) -> Result<Vec<DeviceRecord>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.read_row_group_blocking(index))
            .await
            .context("parquet read task failed")?
    }

    /// Every row of the file, in row-group order.
    pub fn read_all_blocking(&self) -> Result<Vec<DeviceRecord>> {
        let mut records = Vec::new();
        for index in 0..self.num_row_groups {
            records.extend(self.read_row_group_blocking(index)?);
        }
        Ok(records)
    }
}

fn column_values(array: &ArrayRef) -> Result<Vec<Value>> {
    let len = array.len();
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; len],
        DataType::Boolean => {
            let a = array.as_boolean();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Value::Bool(a.value(i))
                    }
                })
                .collect()
        }
        t if t.is_integer() => {
            let cast_array = cast(array, &DataType::Int64)?;
            let a = cast_array.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Value::from(a.value(i))
                    }
                })
                .collect()
        }
        t if t.is_floating() => {
            let cast_array = cast(array, &DataType::Float64)?;
            let a = cast_array.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Value::from(a.value(i))
                    }
                })
                .collect()
        }
        _ => {
            let cast_array = cast(array, &DataType::Utf8)?;
            let a = cast_array.as_string::<i32>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Value::String(a.value(i).to_string())
                    }
                })
                .collect()
        }
    };
    Ok(values)
}

/// Convert a batch into records keyed by column name.
pub fn batch_to_records(batch: &RecordBatch) -> Result<Vec<DeviceRecord>> {
    let schema = batch.schema();
    let mut records = vec![DeviceRecord::new(); batch.num_rows()];
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let values = column_values(column)
            .with_context(|| format!("Unsupported column '{}'", field.name()))?;
        for (record, value) in records.iter_mut().zip(values) {
            record.set(field.name().clone(), value);
        }
    }
    Ok(records)
}

/// Fixed output schema, in output column order.
pub fn output_schema() -> SchemaRef {
    let fields: Vec<Field> = OUTPUT_FIELDS
        .iter()
        .map(|&name| {
            let data_type = match name {
                "connectionType" | "location_type" => DataType::Int64,
                "latitude" | "longitude" => DataType::Float64,
                _ => DataType::Utf8,
            };
            Field::new(name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// The schema records read from `schema` can be written back with.
pub fn writable_schema(schema: &Schema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| {
            let data_type = match f.data_type() {
                DataType::Boolean => DataType::Boolean,
                t if t.is_integer() => DataType::Int64,
                t if t.is_floating() => DataType::Float64,
                _ => DataType::Utf8,
            };
            Field::new(f.name(), data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse::<bool>().ok(),
        _ => None,
    }
}

/// Build a batch with `schema` from records; missing fields become null.
pub fn records_to_batch(records: &[DeviceRecord], schema: &SchemaRef) -> Result<RecordBatch> {
    let n = records.len();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for field in schema.fields() {
        let name = field.name().as_str();
        let column: ArrayRef = match field.data_type() {
            DataType::Utf8 => {
                let mut b = StringBuilder::with_capacity(n, n * 16);
                for r in records {
                    b.append_option(r.get(name).and_then(value_to_text));
                }
                Arc::new(b.finish())
            }
            DataType::Int64 => {
                let mut b = Int64Builder::with_capacity(n);
                for r in records {
                    b.append_option(r.get(name).and_then(value_as_i64));
                }
                Arc::new(b.finish())
            }
            DataType::Float64 => {
                let mut b = Float64Builder::with_capacity(n);
                for r in records {
                    b.append_option(r.get(name).and_then(value_as_f64));
                }
                Arc::new(b.finish())
            }
            DataType::Boolean => {
                let mut b = BooleanBuilder::with_capacity(n);
                for r in records {
                    b.append_option(r.get(name).and_then(value_as_bool));
                }
                Arc::new(b.finish())
            }
            other => bail!("cannot write column '{}' of type {}", name, other),
        };
        columns.push(column);
    }

    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

/// Reshape a batch onto `schema` by column name, casting where needed.
fn conform_batch(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let column = match batch.column_by_name(field.name()) {
            Some(col) if col.data_type() == field.data_type() => col.clone(),
            Some(col) => cast(col, field.data_type())
                .with_context(|| format!("Cannot convert column '{}'", field.name()))?,
            None => new_null_array(field.data_type(), batch.num_rows()),
        };
        columns.push(column);
    }
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

fn collect_ref_ids(batch: &RecordBatch, seen: &mut HashSet<String>) -> Result<()> {
    let Some(column) = batch.column_by_name("refId") else {
        return Ok(());
    };
    let column = cast(column, &DataType::Utf8)?;
    let ids = column.as_string::<i32>();
    for i in 0..ids.len() {
        if ids.is_valid(i) && !ids.value(i).is_empty() {
            seen.insert(ids.value(i).to_string());
        }
    }
    Ok(())
}

pub fn parse_compression(name: &str) -> Result<Compression> {
    match name {
        "snappy" => Ok(Compression::SNAPPY),
        "zstd" => Ok(Compression::ZSTD(ZstdLevel::default())),
        "none" => Ok(Compression::UNCOMPRESSED),
        other => bail!("Unknown compression: '{}'", other),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Write batches to `path` through a temp file and rename.
///
/// With `row_group_per_batch` every batch is flushed as its own row-group.
fn write_atomic(
    path: &Path,
    schema: SchemaRef,
    batches: &[RecordBatch],
    compression: Compression,
    row_group_per_batch: bool,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let tmp = temp_path(path);
    let written = (|| -> Result<()> {
        let file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
        let props = WriterProperties::builder()
            .set_compression(compression)
            .build();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
        for batch in batches {
            writer.write(batch)?;
            if row_group_per_batch {
                writer.flush()?;
            }
        }
        writer.close()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Write one row-group per slice of records, replacing `path`.
pub fn write_row_groups(
    path: &Path,
    schema: SchemaRef,
    groups: &[Vec<DeviceRecord>],
    compression: Compression,
) -> Result<()> {
    let batches = groups
        .iter()
        .map(|records| records_to_batch(records, &schema))
        .collect::<Result<Vec<_>>>()?;
    write_atomic(path, schema, &batches, compression, true)
}

/// Outcome of merging new records into an output file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub existing_rows: usize,
    pub written_rows: usize,
    pub skipped_duplicates: usize,
}

/// Append `records` to the output file at `path`, creating it if needed.
///
/// Existing rows are kept (reshaped onto the output schema). With
/// `dedupe_by_ref_id`, incoming rows whose non-empty `refId` is already
/// in the file are skipped.
pub fn write_output_blocking(
    path: &Path,
    records: Vec<DeviceRecord>,
    options: &OutputConfig,
) -> Result<WriteSummary> {
    let schema = output_schema();
    let compression = parse_compression(&options.compression)?;
    let mut summary = WriteSummary::default();
    let mut batches = Vec::new();
    let mut seen = HashSet::new();

    if path.exists() {
        let file = File::open(path)
            .with_context(|| format!("Failed to open existing output {}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("Existing output is not parquet: {}", path.display()))?
            .build()?;
        for batch in reader {
            let batch = conform_batch(&batch?, &schema)?;
            if options.dedupe_by_ref_id {
                collect_ref_ids(&batch, &mut seen)?;
            }
            summary.existing_rows += batch.num_rows();
            batches.push(batch);
        }
    }

    let incoming = records.len();
    let records: Vec<DeviceRecord> = if options.dedupe_by_ref_id && !seen.is_empty() {
        records
            .into_iter()
            .filter(|r| match r.text("refId") {
                Some(id) if !id.is_empty() => !seen.contains(&id),
                _ => true,
            })
            .collect()
    } else {
        records
    };
    summary.skipped_duplicates = incoming - records.len();
    summary.written_rows = records.len();

    batches.push(records_to_batch(&records, &schema)?);
    write_atomic(path, schema, &batches, compression, false)?;
    Ok(summary)
}

pub async fn write_output(
    path: PathBuf,
    records: Vec<DeviceRecord>,
    options: OutputConfig,
) -> Result<WriteSummary> {
    tokio::task::spawn_blocking(move || write_output_blocking(&path, records, &options))
        .await
        .context("parquet write task failed")?
}
