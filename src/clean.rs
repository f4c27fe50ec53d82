//! Cleaning pass over raw input files.
//!
//! Each input is rewritten in place, one output row-group per input
//! row-group. Rows without any device identification, without
//! coordinates, or without any identifier are discarded; `device_ifa` is
//! backfilled from the hashed identifiers; exact duplicates inside a
//! row-group are dropped.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use arrow::datatypes::DataType;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::connector_fs;
use crate::models::DeviceRecord;
use crate::parquet_io::{self, ParquetSource};

/// Discard counters, per file or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub rows_in: u64,
    pub rows_out: u64,
    pub discarded_make_model: u64,
    pub discarded_lat_long: u64,
    pub discarded_ids: u64,
    pub discarded_duplicates: u64,
}

impl CleanStats {
    fn absorb(&mut self, other: &CleanStats) {
        self.rows_in += other.rows_in;
        self.rows_out += other.rows_out;
        self.discarded_make_model += other.discarded_make_model;
        self.discarded_lat_long += other.discarded_lat_long;
        self.discarded_ids += other.discarded_ids;
        self.discarded_duplicates += other.discarded_duplicates;
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanSummary {
    pub files_cleaned: usize,
    pub files_failed: Vec<String>,
    pub stats: CleanStats,
}

impl CleanSummary {
    pub fn print(&self) {
        println!("clean");
        println!("  files cleaned: {}", self.files_cleaned);
        println!("  files failed: {}", self.files_failed.len());
        println!("  rows in: {}", self.stats.rows_in);
        println!("  rows out: {}", self.stats.rows_out);
        println!(
            "  discarded (empty make/model): {}",
            self.stats.discarded_make_model
        );
        println!(
            "  discarded (empty lat/long): {}",
            self.stats.discarded_lat_long
        );
        println!("  discarded (no identifiers): {}", self.stats.discarded_ids);
        println!(
            "  discarded (duplicates): {}",
            self.stats.discarded_duplicates
        );
        println!("ok");
    }
}

fn is_blank(record: &DeviceRecord, field: &str) -> bool {
    match record.get(field) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Clean one row-group. `text_fields` are the columns whose nulls become "".
pub fn clean_row_group(
    records: Vec<DeviceRecord>,
    text_fields: &[String],
    stats: &mut CleanStats,
) -> Vec<DeviceRecord> {
    stats.rows_in += records.len() as u64;
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(records.len());

    for mut record in records {
        for field in text_fields {
            if matches!(record.get(field), None | Some(Value::Null)) {
                record.set_text(field.clone(), "");
            }
        }

        if is_blank(&record, "device_vendor") && is_blank(&record, "device_model") {
            stats.discarded_make_model += 1;
            continue;
        }
        if is_blank(&record, "latitude") && is_blank(&record, "longitude") {
            stats.discarded_lat_long += 1;
            continue;
        }
        if ["device_ifa", "dpidsha1", "dpidmd5"]
            .iter()
            .all(|f| is_blank(&record, f))
        {
            stats.discarded_ids += 1;
            continue;
        }

        if is_blank(&record, "device_ifa") {
            let fill = if is_blank(&record, "dpidsha1") {
                record.text_or_empty("dpidmd5")
            } else {
                record.text_or_empty("dpidsha1")
            };
            record.set_text("device_ifa", fill);
        }

        let fingerprint = serde_json::to_string(&record).unwrap_or_default();
        if !seen.insert(fingerprint) {
            stats.discarded_duplicates += 1;
            continue;
        }
        kept.push(record);
    }

    stats.rows_out += kept.len() as u64;
    kept
}

/// Clean one file in place.
pub async fn clean_file(path: &Path, compression: &str) -> Result<CleanStats> {
    let source = ParquetSource::open(path)?;
    let schema = parquet_io::writable_schema(&source.schema());
    let text_fields: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| f.data_type() == &DataType::Utf8)
        .map(|f| f.name().clone())
        .collect();

    let mut stats = CleanStats::default();
    let mut groups = Vec::with_capacity(source.num_row_groups());
    for index in 0..source.num_row_groups() {
        let records = source.read_row_group(index).await?;
        let cleaned = clean_row_group(records, &text_fields, &mut stats);
        if !cleaned.is_empty() {
            groups.push(cleaned);
        }
    }

    let compression = parquet_io::parse_compression(compression)?;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        parquet_io::write_row_groups(&target, schema, &groups, compression)
    })
    .await??;
    Ok(stats)
}

/// Clean every input file. A file that fails is left untouched.
pub async fn clean_inputs(config: &Config) -> Result<CleanSummary> {
    let inputs = connector_fs::discover_inputs(&config.paths)?;
    let mut summary = CleanSummary::default();

    for path in inputs {
        match clean_file(&path, &config.output.compression).await {
            Ok(stats) => {
                info!(
                    file = %path.display(),
                    rows_in = stats.rows_in,
                    rows_out = stats.rows_out,
                    "cleaned file"
                );
                summary.files_cleaned += 1;
                summary.stats.absorb(&stats);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %format!("{:#}", e), "failed to clean file");
                summary.files_failed.push(path.display().to_string());
            }
        }
    }

    info!(
        make_model = summary.stats.discarded_make_model,
        lat_long = summary.stats.discarded_lat_long,
        ids = summary.stats.discarded_ids,
        duplicates = summary.stats.discarded_duplicates,
        "cleaning summary"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(vendor: Value, lat: Value, ifa: Value, sha: Value, md5: Value) -> DeviceRecord {
        [
            ("device_vendor", vendor),
            ("device_model", json!("")),
            ("latitude", lat),
            ("longitude", Value::Null),
            ("device_ifa", ifa),
            ("dpidsha1", sha),
            ("dpidmd5", md5),
        ]
        .into_iter()
        .collect()
    }

    fn text_fields() -> Vec<String> {
        ["device_vendor", "device_model", "device_ifa", "dpidsha1", "dpidmd5"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn applies_discard_rules_and_backfills_ifa() {
        let rows = vec![
            row(Value::Null, json!(1.0), json!("a"), json!(""), json!("")),
            row(json!("apple"), Value::Null, json!("a"), json!(""), json!("")),
            row(json!("apple"), json!(1.0), Value::Null, json!(""), Value::Null),
            row(json!("apple"), json!(1.0), Value::Null, json!(""), json!("md5")),
            row(json!("apple"), json!(1.0), json!(""), json!("sha"), json!("md5")),
            row(json!("apple"), json!(1.0), json!(""), json!("sha"), json!("md5")),
        ];

        let mut stats = CleanStats::default();
        let kept = clean_row_group(rows, &text_fields(), &mut stats);

        assert_eq!(stats.rows_in, 6);
        assert_eq!(stats.discarded_make_model, 1);
        assert_eq!(stats.discarded_lat_long, 1);
        assert_eq!(stats.discarded_ids, 1);
        assert_eq!(stats.discarded_duplicates, 1);
        assert_eq!(stats.rows_out, 2);

        assert_eq!(kept[0].text("device_ifa").as_deref(), Some("md5"));
        assert_eq!(kept[0].text("dpidsha1").as_deref(), Some(""));
        assert_eq!(kept[1].text("device_ifa").as_deref(), Some("sha"));
    }
}
