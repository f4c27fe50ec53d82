//! In-memory [`KvStore`] implementation for tests and dry runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Every mutating call bumps a
//! write counter so tests can assert that a code path did not write.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::KvStore;

struct StoredValue {
    value: String,
    expires_at: Option<i64>,
}

impl StoredValue {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryKv {
    sets: RwLock<HashMap<String, BTreeSet<String>>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    values: RwLock<HashMap<String, StoredValue>>,
    writes: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls served so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Insert a value with an absolute expiry, bypassing the write counter.
    pub fn insert_with_expiry(&self, key: &str, value: &str, expires_at: Option<i64>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(
                key.to_string(),
                StoredValue {
                    value: value.to_string(),
                    expires_at,
                },
            );
        }
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("memory store lock poisoned")
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let sets = self.sets.read().map_err(poisoned)?;
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64> {
        self.bump();
        let mut sets = self.sets.write().map_err(poisoned)?;
        let set = sets.entry(key.to_string()).or_default();
        let added = members.iter().filter(|m| set.insert((*m).clone())).count();
        Ok(added as u64)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let hashes = self.hashes.read().map_err(poisoned)?;
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let hashes = self.hashes.read().map_err(poisoned)?;
        Ok(hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_many(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let hashes = self.hashes.read().map_err(poisoned)?;
        let hash = hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f)).cloned())
            .collect())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.bump();
        let mut hashes = self.hashes.write().map_err(poisoned)?;
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let now = Utc::now().timestamp();
        let values = self.values.read().map_err(poisoned)?;
        Ok(keys
            .iter()
            .map(|k| {
                values
                    .get(k)
                    .filter(|v| v.is_live(now))
                    .map(|v| v.value.clone())
            })
            .collect())
    }

    async fn set_many_with_expiry(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.bump();
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        let mut values = self.values.write().map_err(poisoned)?;
        for (key, value) in entries {
            values.insert(
                key.clone(),
                StoredValue {
                    value: value.clone(),
                    expires_at: Some(expires_at),
                },
            );
        }
        Ok(())
    }

    async fn count_keys(&self, prefix: &str) -> Result<u64> {
        let now = Utc::now().timestamp();
        let values = self.values.read().map_err(poisoned)?;
        Ok(values
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.is_live(now))
            .count() as u64)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let mut values = self.values.write().map_err(poisoned)?;
        let before = values.len();
        values.retain(|_, v| v.is_live(now));
        Ok((before - values.len()) as u64)
    }
}
