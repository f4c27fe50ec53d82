//! Mapping learner.
//!
//! Streams every input row-group and folds each record's
//! vendor/model/height/width into the model table. Stored entries are only
//! rewritten when the merged details differ after normalization, so
//! re-learning the same files performs no writes.

use tracing::{info, warn};

use crate::config::Config;
use crate::connector_fs;
use crate::correct::{FIELD_HEIGHT, FIELD_MODEL, FIELD_UA, FIELD_VENDOR, FIELD_WIDTH};
use crate::error::Result;
use crate::mapping::MappingStore;
use crate::models::{normalize, DeviceRecord, ModelDetails};
use crate::parquet_io::ParquetSource;
use crate::vendor::{extract_vendor_from_ua, remove_token, VendorSet};

/// Vendors this short are usually codes; `lg` is the real exception.
const SHORT_VENDOR_LEN: usize = 3;
const SHORT_VENDOR_ALLOWED: &str = "lg";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearnSummary {
    pub files: usize,
    pub files_skipped: usize,
    pub records_seen: u64,
    pub records_skipped: u64,
    pub entries_written: u64,
}

impl LearnSummary {
    pub fn print(&self) {
        println!("learn");
        println!("  files: {} ({} skipped)", self.files, self.files_skipped);
        println!("  records seen: {}", self.records_seen);
        println!("  records skipped: {}", self.records_skipped);
        println!("  mapping entries written: {}", self.entries_written);
        println!("ok");
    }
}

/// Details a single record contributes, before merging with the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub model: String,
    pub details: ModelDetails,
}

/// Derive the model key and details from one record.
///
/// Returns `None` when the record has no usable model.
pub fn observe(record: &DeviceRecord, vendors: &VendorSet) -> Option<Observation> {
    let mut model = normalize(&record.text_or_empty(FIELD_MODEL));
    let mut vendor = normalize(&record.text_or_empty(FIELD_VENDOR));
    let height = normalize(&record.text_or_empty(FIELD_HEIGHT));
    let width = normalize(&record.text_or_empty(FIELD_WIDTH));

    if !vendor.is_empty() && vendors.contains(&vendor) {
        model = remove_token(&model, &vendor);
    }
    let short_code = vendor.len() <= SHORT_VENDOR_LEN && vendor != SHORT_VENDOR_ALLOWED;
    if vendor.is_empty() || short_code {
        vendor = record
            .text(FIELD_UA)
            .and_then(|ua| extract_vendor_from_ua(&ua, vendors, None))
            .unwrap_or_default();
    }

    if model.is_empty() {
        return None;
    }
    Some(Observation {
        model,
        details: ModelDetails::new(vendor, height, width),
    })
}

/// Empty observed values keep what is already stored.
pub fn merge_details(observed: &ModelDetails, existing: Option<&ModelDetails>) -> ModelDetails {
    let pick = |new: &str, old: Option<&str>| {
        if new.is_empty() {
            old.unwrap_or_default().to_string()
        } else {
            new.to_string()
        }
    };
    ModelDetails {
        vendor: pick(&observed.vendor, existing.map(|e| e.vendor.as_str())),
        height: pick(&observed.height, existing.map(|e| e.height.as_str())),
        width: pick(&observed.width, existing.map(|e| e.width.as_str())),
    }
}

/// Fold one record into the model table. Returns whether a write happened.
pub async fn learn_record(
    record: &DeviceRecord,
    vendors: &VendorSet,
    mapping: &MappingStore,
) -> Result<Option<bool>> {
    let Some(obs) = observe(record, vendors) else {
        return Ok(None);
    };
    let existing = mapping.get_model(&obs.model).await?;
    let merged = merge_details(&obs.details, existing.as_ref());
    mapping
        .update_model_mapping(&obs.model, &merged)
        .await
        .map(Some)
}

/// Learn from every input file. Unreadable files are logged and skipped.
pub async fn learn_from_inputs(
    config: &Config,
    mapping: &MappingStore,
) -> anyhow::Result<LearnSummary> {
    let vendors = mapping.load_or_create_vendors().await?;
    let inputs = connector_fs::discover_inputs(&config.paths)?;
    let mut summary = LearnSummary::default();

    for path in inputs {
        summary.files += 1;
        let source = match ParquetSource::open(&path) {
            Ok(source) => source,
            Err(e) => {
                warn!(
                    file = %path.display(),
                    error = %format!("{:#}", e),
                    "skipping unreadable file"
                );
                summary.files_skipped += 1;
                continue;
            }
        };

        for index in 0..source.num_row_groups() {
            let records = match source.read_row_group(index).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        row_group = index,
                        error = %format!("{:#}", e),
                        "skipping rest of file"
                    );
                    summary.files_skipped += 1;
                    break;
                }
            };

            for record in &records {
                summary.records_seen += 1;
                match learn_record(record, &vendors, mapping).await {
                    Ok(Some(true)) => summary.entries_written += 1,
                    Ok(Some(false)) => {}
                    Ok(None) => summary.records_skipped += 1,
                    Err(e) => {
                        warn!(error = %e, "failed to learn from record");
                        summary.records_skipped += 1;
                    }
                }
            }
        }
        info!(file = %path.display(), "learned from file");
    }

    info!(
        records = summary.records_seen,
        written = summary.entries_written,
        "learning pass finished"
    );
    Ok(summary)
}
