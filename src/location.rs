//! Location cache in front of the geocode fetcher.
//!
//! [`LocationCache::bulk_resolve`] deduplicates a batch of coordinates,
//! reads all their cache keys in one round trip, sends only the misses to
//! the [`GeocodeFetcher`], and writes the fresh results back in one batch
//! with the configured expiry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::geocode::GeocodeFetcher;
use crate::kv::KvStore;
use crate::models::{CoordKey, GeoProperties};

/// Prefix shared by every location cache key.
pub const LOCATION_PREFIX: &str = "location:";

/// Cache lookup split into resolved entries and coordinates still to fetch.
#[derive(Debug, Default)]
pub struct CachePartition {
    pub hits: HashMap<CoordKey, GeoProperties>,
    pub misses: Vec<CoordKey>,
}

/// Split `coords` by the raw values read for them (same order).
///
/// Absent values and values that no longer decode are misses.
pub fn partition_hits(coords: &[CoordKey], cached: Vec<Option<String>>) -> CachePartition {
    let mut out = CachePartition::default();
    for (&coord, raw) in coords.iter().zip(cached) {
        let decoded = raw.and_then(|value| match serde_json::from_str::<GeoProperties>(&value) {
            Ok(props) => Some(props),
            Err(e) => {
                warn!(%coord, error = %e, "discarding undecodable cache entry");
                None
            }
        });
        match decoded {
            Some(props) => {
                out.hits.insert(coord, props);
            }
            None => out.misses.push(coord),
        }
    }
    out
}

pub struct LocationCache {
    kv: Arc<dyn KvStore>,
    fetcher: GeocodeFetcher,
    ttl: Duration,
}

impl LocationCache {
    pub fn new(kv: Arc<dyn KvStore>, fetcher: GeocodeFetcher, ttl: Duration) -> Self {
        Self { kv, fetcher, ttl }
    }

    /// Resolve a batch of coordinates. Coordinates with no result are
    /// absent from the map; callers fall back to the record's own fields.
    pub async fn bulk_resolve(
        &self,
        coords: &[CoordKey],
    ) -> Result<HashMap<CoordKey, GeoProperties>> {
        let distinct: Vec<CoordKey> = coords
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if distinct.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = distinct.iter().map(CoordKey::cache_key).collect();
        let cached = self
            .kv
            .get_many(&keys)
            .await
            .map_err(PipelineError::store)?;
        let CachePartition { mut hits, misses } = partition_hits(&distinct, cached);
        debug!(hits = hits.len(), misses = misses.len(), "location cache lookup");

        if misses.is_empty() {
            return Ok(hits);
        }

        let fetched = self.fetcher.fetch_all(&misses).await;
        if !fetched.is_empty() {
            let mut entries = Vec::with_capacity(fetched.len());
            for (coord, props) in &fetched {
                match serde_json::to_string(props) {
                    Ok(value) => entries.push((coord.cache_key(), value)),
                    Err(e) => warn!(%coord, error = %e, "cannot encode geocode result"),
                }
            }
            match self.kv.set_many_with_expiry(&entries, self.ttl).await {
                Ok(()) => info!(cached = entries.len(), "stored geocode results"),
                Err(e) => warn!(error = %e, "failed to store geocode results"),
            }
        }

        hits.extend(fetched);
        Ok(hits)
    }

    /// Number of live cached locations.
    pub async fn cached_count(&self) -> Result<u64> {
        self.kv
            .count_keys(LOCATION_PREFIX)
            .await
            .map_err(PipelineError::store)
    }

    /// Drop expired entries from the backing store.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.kv.purge_expired().await.map_err(PipelineError::store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::ReverseGeocoder;
    use crate::kv::MemoryKv;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReverseGeocoder for CountingGeocoder {
        async fn reverse(
            &self,
            coord: CoordKey,
        ) -> std::result::Result<Option<GeoProperties>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if coord.lon() > 100.0 {
                return Ok(None);
            }
            Ok(Some(GeoProperties {
                city: Some("New York".into()),
                state: Some("NY".into()),
                ..Default::default()
            }))
        }
    }

    fn coord(lat: f64, lon: f64) -> CoordKey {
        CoordKey::new(lat, lon).unwrap()
    }

    #[test]
    fn partition_is_disjoint_and_complete() {
        let coords = vec![coord(1.0, 1.0), coord(2.0, 2.0), coord(3.0, 3.0)];
        let cached = vec![
            Some(r#"{"city":"A"}"#.to_string()),
            None,
            Some("{oops".to_string()),
        ];
        let part = partition_hits(&coords, cached);

        assert_eq!(part.hits.len(), 1);
        assert_eq!(part.misses, vec![coord(2.0, 2.0), coord(3.0, 3.0)]);
        for c in &coords {
            assert!(part.hits.contains_key(c) != part.misses.contains(c));
        }
    }

    #[tokio::test]
    async fn misses_are_fetched_once_then_served_from_cache() {
        let kv = Arc::new(MemoryKv::new());
        let geocoder = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
        });
        let fetcher = GeocodeFetcher::new(geocoder.clone(), 5, Duration::from_secs(5));
        let cache = LocationCache::new(kv.clone(), fetcher, Duration::from_secs(3600));

        let nyc = coord(40.7128, -74.006);
        let nowhere = coord(0.0, 150.0);
        let got = cache.bulk_resolve(&[nyc, nyc, nowhere]).await.unwrap();
        assert_eq!(got[&nyc].city.as_deref(), Some("New York"));
        assert!(!got.contains_key(&nowhere));
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.cached_count().await.unwrap(), 1);

        let again = cache.bulk_resolve(&[nyc]).await.unwrap();
        assert_eq!(again[&nyc].state.as_deref(), Some("NY"));
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
    }
}
