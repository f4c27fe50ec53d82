//! Core data models used throughout the pipeline.
//!
//! These types represent the event records, the learned device mapping and
//! the geocode results that flow through correction and enrichment.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Output record schema, in column order.
pub const OUTPUT_FIELDS: [&str; 29] = [
    "refId",
    "reqTime",
    "reqTimeConverted",
    "deviceIfa",
    "os",
    "osv",
    "normalized_osv",
    "ipAddress",
    "carrier",
    "connectionType",
    "device_vendor",
    "device_model",
    "device_height",
    "device_width",
    "deviceType",
    "location_type",
    "latitude",
    "longitude",
    "appBundle",
    "city",
    "region",
    "state",
    "device_country_name",
    "device_country_code",
    "zip",
    "ua",
    "ssp",
    "dpidsha1",
    "dpidmd5",
];

/// One event record: named fields holding dynamic values.
///
/// Records are read from a row-group, mutated by correction and
/// enrichment, and written back out. Field order is not significant; the
/// writer imposes the output schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRecord {
    fields: BTreeMap<String, Value>,
}

impl DeviceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field rendered as text. Null and absent fields are `None`.
    pub fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(value_to_text)
    }

    /// Field rendered as text, empty when null or absent.
    pub fn text_or_empty(&self, name: &str) -> String {
        self.text(name).unwrap_or_default()
    }

    /// Field parsed as a float, accepting numeric strings.
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn set_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), Value::String(value.into()));
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for DeviceRecord {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Render a scalar value as text. Null yields `None`.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Lower-case and trim, the normalization applied to every mapping key and value.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Stored details for one device model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default, deserialize_with = "lenient_string")]
    pub vendor: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub height: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub width: String,
}

impl ModelDetails {
    pub fn new(
        vendor: impl Into<String>,
        height: impl Into<String>,
        width: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            height: height.into(),
            width: width.into(),
        }
    }

    /// Copy with every field lower-cased and trimmed.
    pub fn normalized(&self) -> Self {
        Self {
            vendor: normalize(&self.vendor),
            height: normalize(&self.height),
            width: normalize(&self.width),
        }
    }
}

/// Place attributes returned by the reverse geocoder.
///
/// Every field is optional: a response that omits one falls back to the
/// record's own value during enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoProperties {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_string")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_string")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_string")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_string")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_string")]
    pub countrycode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_string")]
    pub postcode: Option<String>,
}

impl GeoProperties {
    /// True when no recognised attribute is present.
    pub fn is_empty(&self) -> bool {
        self.city.is_none()
            && self.district.is_none()
            && self.state.is_none()
            && self.country.is_none()
            && self.countrycode.is_none()
            && self.postcode.is_none()
    }
}

/// A validated coordinate pair, discretized to micro-degrees.
///
/// Only constructible from a pair inside the latitude/longitude bounds,
/// so an invalid coordinate can never reach the cache or the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordKey {
    lat_e6: i64,
    lon_e6: i64,
}

const MICRO: f64 = 1_000_000.0;

impl CoordKey {
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !is_valid_lat_lon(lat, lon) {
            return None;
        }
        Some(Self {
            lat_e6: (lat * MICRO).round() as i64,
            lon_e6: (lon * MICRO).round() as i64,
        })
    }

    pub fn lat(&self) -> f64 {
        self.lat_e6 as f64 / MICRO
    }

    pub fn lon(&self) -> f64 {
        self.lon_e6 as f64 / MICRO
    }

    pub fn lat_param(&self) -> String {
        format!("{:.6}", self.lat())
    }

    pub fn lon_param(&self) -> String {
        format!("{:.6}", self.lon())
    }

    /// Location cache key: `location:<lat>:<lon>`.
    pub fn cache_key(&self) -> String {
        format!("location:{}:{}", self.lat_param(), self.lon_param())
    }
}

impl fmt::Display for CoordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.lat_param(), self.lon_param())
    }
}

/// Latitude within [-90, 90] and longitude within [-180, 180]. NaN is never valid.
pub fn is_valid_lat_lon(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

/// Accepts strings, numbers and booleans; null becomes `None`.
fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_text(&value))
}
