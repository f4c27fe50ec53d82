//! Device field correction.
//!
//! Normalizes `device_vendor` / `device_model`, recovers the vendor from
//! the user-agent for generic android records, strips vendor tokens out of
//! model names, and overlays height/width/vendor from the learned model
//! table. The table is consulted once per batch with the distinct
//! corrected models.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::mapping::ModelLookup;
use crate::models::{normalize, DeviceRecord};
use crate::vendor::{extract_vendor_from_ua, strip_vendor_token, VendorSet};

pub const FIELD_VENDOR: &str = "device_vendor";
pub const FIELD_MODEL: &str = "device_model";
pub const FIELD_HEIGHT: &str = "device_height";
pub const FIELD_WIDTH: &str = "device_width";
pub const FIELD_UA: &str = "ua";
pub const FIELD_OS_VERSION: &str = "os_version";
pub const FIELD_NORMALIZED_OS_VERSION: &str = "normalized_os_version";

const ANDROID: &str = "android";

/// Corrected records of one batch, plus how many were dropped.
#[derive(Debug, Default)]
pub struct CorrectionOutcome {
    pub records: Vec<DeviceRecord>,
    pub dropped: usize,
}

pub struct DeviceCorrector<'a> {
    vendors: &'a VendorSet,
    lookup: &'a dyn ModelLookup,
}

/// First-pass result for one record.
struct Pending {
    record: DeviceRecord,
    /// Corrected model to resolve against the table; `None` skips the lookup.
    model: Option<String>,
    vendor: String,
}

impl<'a> DeviceCorrector<'a> {
    pub fn new(vendors: &'a VendorSet, lookup: &'a dyn ModelLookup) -> Self {
        Self { vendors, lookup }
    }

    /// Correct a batch. Per-record failures drop that record only; a
    /// failing model lookup fails the whole batch.
    pub async fn correct_batch(&self, records: Vec<DeviceRecord>) -> Result<CorrectionOutcome> {
        let mut pending = Vec::with_capacity(records.len());
        let mut dropped = 0;

        for (row, record) in records.into_iter().enumerate() {
            match self.correct_record(row, record) {
                Ok(p) => pending.push(p),
                Err(e) => {
                    warn!(error = %e, "dropping record during device correction");
                    dropped += 1;
                }
            }
        }

        let models: Vec<String> = pending
            .iter()
            .filter_map(|p| p.model.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let table = if models.is_empty() {
            Default::default()
        } else {
            self.lookup.bulk_lookup(&models).await?
        };
        debug!(
            distinct_models = models.len(),
            matched = table.len(),
            "model lookup"
        );

        let records = pending
            .into_iter()
            .map(|p| {
                let Pending {
                    mut record,
                    model,
                    vendor,
                } = p;
                let mut vendor = vendor;
                if let Some(model) = model {
                    if let Some(details) = table.get(&model) {
                        if !details.vendor.is_empty() {
                            vendor = details.vendor.clone();
                        }
                        if !details.height.is_empty() {
                            record.set_text(FIELD_HEIGHT, details.height.clone());
                        }
                        if !details.width.is_empty() {
                            record.set_text(FIELD_WIDTH, details.width.clone());
                        }
                    }
                    record.set_text(FIELD_MODEL, model);
                }
                record.set_text(FIELD_VENDOR, vendor);
                record
            })
            .collect();

        Ok(CorrectionOutcome { records, dropped })
    }

    fn correct_record(&self, row: usize, mut record: DeviceRecord) -> Result<Pending> {
        let model = record
            .text(FIELD_MODEL)
            .map(|m| normalize(&m))
            .ok_or_else(|| PipelineError::row(row, "device_model is missing"))?;
        let vendor = normalize(&record.text_or_empty(FIELD_VENDOR));

        let os_major = record
            .text(FIELD_OS_VERSION)
            .map(|v| v.split('.').next().unwrap_or_default().to_string())
            .unwrap_or_default();
        record.set_text(FIELD_NORMALIZED_OS_VERSION, os_major);

        if model.contains(ANDROID) || vendor.contains(ANDROID) {
            let context = format!("{vendor} {model}");
            let extracted = record
                .text(FIELD_UA)
                .and_then(|ua| extract_vendor_from_ua(&ua, self.vendors, Some(&context)));
            return Ok(Pending {
                record,
                model: None,
                vendor: extracted.unwrap_or(vendor),
            });
        }

        let (model, vendor) = match strip_vendor_token(&model, self.vendors) {
            Some((stripped, token)) if vendor.is_empty() => (stripped, token),
            Some((stripped, _)) => (stripped, vendor),
            None => (model, vendor),
        };

        Ok(Pending {
            record,
            model: Some(model),
            vendor,
        })
    }
}
