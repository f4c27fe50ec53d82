//! Enrichment: resolve coordinates and project records onto the output schema.
//!
//! Valid coordinate pairs of a batch are resolved through the
//! [`LocationCache`] in one call. Each record is then mapped onto
//! [`OUTPUT_FIELDS`]; place fields prefer the geocode result and fall back
//! to the record's own values.

use chrono::DateTime;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::location::LocationCache;
use crate::models::{CoordKey, DeviceRecord, GeoProperties, OUTPUT_FIELDS};

const REQ_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Enriched records of one batch, plus how many were dropped.
#[derive(Debug, Default)]
pub struct EnrichOutcome {
    pub records: Vec<DeviceRecord>,
    pub dropped: usize,
    pub resolved: usize,
}

pub struct Enricher<'a> {
    cache: &'a LocationCache,
}

impl<'a> Enricher<'a> {
    pub fn new(cache: &'a LocationCache) -> Self {
        Self { cache }
    }

    pub async fn enrich_batch(&self, records: Vec<DeviceRecord>) -> Result<EnrichOutcome> {
        let coords: Vec<Option<CoordKey>> = records.iter().map(record_coord).collect();
        let wanted: Vec<CoordKey> = coords.iter().flatten().copied().collect();
        let resolved = self.cache.bulk_resolve(&wanted).await?;

        let mut out = EnrichOutcome {
            records: Vec::with_capacity(records.len()),
            resolved: resolved.len(),
            ..Default::default()
        };
        for (row, (record, coord)) in records.iter().zip(coords).enumerate() {
            let geo = coord.and_then(|c| resolved.get(&c));
            match transform_record(row, record, geo) {
                Ok(rec) => out.records.push(rec),
                Err(e) => {
                    warn!(error = %e, "dropping record during enrichment");
                    out.dropped += 1;
                }
            }
        }
        debug!(
            records = out.records.len(),
            dropped = out.dropped,
            locations = out.resolved,
            "batch enriched"
        );
        Ok(out)
    }
}

/// The record's coordinate, when both parts parse and are in range.
pub fn record_coord(record: &DeviceRecord) -> Option<CoordKey> {
    CoordKey::new(record.number("latitude")?, record.number("longitude")?)
}

/// Project one record onto the output schema.
pub fn transform_record(
    row: usize,
    record: &DeviceRecord,
    geo: Option<&GeoProperties>,
) -> Result<DeviceRecord> {
    let text = |name: &str| Value::String(record.text_or_empty(name));
    let place = |pick: fn(&GeoProperties) -> &Option<String>, fallback: Option<&str>| {
        geo.and_then(|g| pick(g).clone())
            .or_else(|| fallback.and_then(|f| record.text(f)))
            .map(Value::String)
            .unwrap_or_else(|| Value::String(String::new()))
    };

    let mut out = DeviceRecord::new();
    out.set("refId", text("refId"));
    out.set("reqTime", text("date"));
    out.set("reqTimeConverted", Value::String(convert_req_time(row, record)?));
    out.set("deviceIfa", text("device_ifa"));
    out.set("os", text("os"));
    out.set("osv", text("os_version"));
    out.set("normalized_osv", text("normalized_os_version"));
    out.set("ipAddress", text("ip"));
    out.set("carrier", text("carrier"));
    out.set("connectionType", optional_int(row, record, "connection_type")?);
    out.set("device_vendor", text("device_vendor"));
    out.set("device_model", text("device_model"));
    out.set("device_height", text("device_height"));
    out.set("device_width", text("device_width"));
    out.set("deviceType", text("device_type"));
    out.set("location_type", optional_int(row, record, "location_type")?);
    out.set("latitude", optional_float(record, "latitude"));
    out.set("longitude", optional_float(record, "longitude"));
    out.set("appBundle", text("app_bundle"));
    out.set("city", place(|g| &g.city, Some("city")));
    out.set("region", place(|g| &g.district, None));
    out.set("state", place(|g| &g.state, Some("region")));
    out.set(
        "device_country_name",
        place(|g| &g.country, Some("device_country_name")),
    );
    out.set(
        "device_country_code",
        place(|g| &g.countrycode, Some("device_country_code")),
    );
    out.set("zip", place(|g| &g.postcode, Some("zip")));
    out.set("ua", text("ua"));
    out.set("ssp", text("ssp_endpoint_name"));
    out.set("dpidsha1", text("dpidsha1"));
    out.set("dpidmd5", text("dpidmd5"));

    debug_assert_eq!(out.len(), OUTPUT_FIELDS.len());
    Ok(out)
}

/// Null, empty strings, zero and `false` are all "unset".
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map_or(true, |f| f != 0.0),
        Some(Value::Bool(b)) => *b,
        Some(_) => true,
    }
}

/// Millisecond epoch `date` rendered as UTC `YYYY-MM-DD HH:MM:SS`.
fn convert_req_time(row: usize, record: &DeviceRecord) -> Result<String> {
    if !is_truthy(record.get("date")) {
        return Ok(String::new());
    }
    let millis = record
        .number("date")
        .ok_or_else(|| PipelineError::row(row, "date is not numeric"))?;
    let ts = DateTime::from_timestamp_millis(millis as i64)
        .ok_or_else(|| PipelineError::row(row, format!("date {} out of range", millis)))?;
    Ok(ts.format(REQ_TIME_FORMAT).to_string())
}

fn optional_int(row: usize, record: &DeviceRecord, name: &str) -> Result<Value> {
    if !is_truthy(record.get(name)) {
        return Ok(Value::Null);
    }
    let n = record
        .number(name)
        .ok_or_else(|| PipelineError::row(row, format!("{} is not numeric", name)))?;
    Ok(Value::from(n.trunc() as i64))
}

fn optional_float(record: &DeviceRecord, name: &str) -> Value {
    record
        .number(name)
        .filter(|f| f.is_finite())
        .map(Value::from)
        .unwrap_or(Value::Null)
}
