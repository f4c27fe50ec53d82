//! Reverse geocoding client and the bounded-concurrency fetcher.
//!
//! [`HttpGeocoder`] speaks the `GET <base>/reverse?lat=..&lon=..` API and
//! returns the first feature's properties. [`GeocodeFetcher`] fans a batch
//! of coordinates out over any [`ReverseGeocoder`], holding at most
//! `max_in_flight` lookups open at once and giving each one a fixed
//! timeout. Failed lookups are logged and left out of the result; they are
//! not retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::GeocoderConfig;
use crate::error::PipelineError;
use crate::models::{CoordKey, GeoProperties};

/// A reverse geocoding backend.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    /// Resolve one coordinate. `Ok(None)` means the backend answered but
    /// had nothing for this place.
    async fn reverse(&self, coord: CoordKey) -> Result<Option<GeoProperties>, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Option<GeoProperties>,
}

/// Extract the first feature's properties. Empty properties count as no result.
fn first_properties(body: ReverseResponse) -> Option<GeoProperties> {
    body.features
        .into_iter()
        .next()
        .and_then(|f| f.properties)
        .filter(|p| !p.is_empty())
}

/// HTTP client for a Photon-style `/reverse` endpoint.
pub struct HttpGeocoder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGeocoder {
    pub fn new(config: &GeocoderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        let endpoint = format!("{}/reverse", config.base_url.trim_end_matches('/'));
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ReverseGeocoder for HttpGeocoder {
    async fn reverse(&self, coord: CoordKey) -> Result<Option<GeoProperties>, PipelineError> {
        let transport = |reason: String| PipelineError::LookupTransport { coord, reason };

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("lat", coord.lat_param()), ("lon", coord.lon_param())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::LookupTimeout(coord)
                } else {
                    transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(transport(format!("HTTP {}", status)));
        }

        let body: ReverseResponse = response
            .json()
            .await
            .map_err(|e| transport(format!("invalid response body: {}", e)))?;
        Ok(first_properties(body))
    }
}

/// Runs lookups for a batch of coordinates behind an admission gate.
#[derive(Clone)]
pub struct GeocodeFetcher {
    geocoder: Arc<dyn ReverseGeocoder>,
    gate: Arc<Semaphore>,
    timeout: Duration,
}

impl GeocodeFetcher {
    pub fn new(geocoder: Arc<dyn ReverseGeocoder>, max_in_flight: usize, timeout: Duration) -> Self {
        Self {
            geocoder,
            gate: Arc::new(Semaphore::new(max_in_flight.max(1))),
            timeout,
        }
    }

    pub fn from_config(config: &GeocoderConfig) -> anyhow::Result<Self> {
        let geocoder = HttpGeocoder::new(config)?;
        Ok(Self::new(
            Arc::new(geocoder),
            config.max_in_flight,
            config.timeout(),
        ))
    }

    /// Look up every coordinate once. Coordinates that fail or have no
    /// result are absent from the returned map.
    pub async fn fetch_all(&self, coords: &[CoordKey]) -> HashMap<CoordKey, GeoProperties> {
        let lookups = coords.iter().map(|&coord| async move {
            let outcome = self.fetch_one(coord).await;
            (coord, outcome)
        });

        let mut found = HashMap::new();
        let mut failed = 0usize;
        for (coord, outcome) in join_all(lookups).await {
            match outcome {
                Ok(Some(props)) => {
                    found.insert(coord, props);
                }
                Ok(None) => debug!(%coord, "no geocode result"),
                Err(e) => {
                    failed += 1;
                    warn!(%coord, error = %e, "geocode lookup failed");
                }
            }
        }
        debug!(
            requested = coords.len(),
            resolved = found.len(),
            failed,
            "geocode batch finished"
        );
        found
    }

    async fn fetch_one(&self, coord: CoordKey) -> Result<Option<GeoProperties>, PipelineError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| PipelineError::LookupTransport {
                coord,
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.timeout, self.geocoder.reverse(coord)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::LookupTimeout(coord)),
        }
    }
}
