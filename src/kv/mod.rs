//! Key-value abstraction behind the mapping store and the location cache.
//!
//! The [`KvStore`] trait exposes the small command set the pipeline needs
//! (sets, hashes, multi-get, batched expiring writes), so the backend can
//! be swapped between SQLite and memory without touching callers.
//!
//! | Method | Used by |
//! |--------|---------|
//! | [`set_members`](KvStore::set_members) / [`set_add`](KvStore::set_add) | vendor set |
//! | [`hash_get_all`](KvStore::hash_get_all) / [`hash_get`](KvStore::hash_get) / [`hash_get_many`](KvStore::hash_get_many) / [`hash_set`](KvStore::hash_set) | model mapping |
//! | [`get_many`](KvStore::get_many) / [`set_many_with_expiry`](KvStore::set_many_with_expiry) | location cache |

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

/// Abstract key-value backend.
///
/// Implementations serialize concurrent writers themselves; callers do no
/// locking. Expired values must read as absent.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Round-trip check used at startup.
    async fn ping(&self) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Add members to a set. Returns how many were not already present.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Fetch many hash fields in one round trip, in input order.
    async fn hash_get_many(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Fetch many plain values in one round trip, in input order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Write many plain values in one batch, each expiring after `ttl`.
    async fn set_many_with_expiry(&self, entries: &[(String, String)], ttl: Duration)
        -> Result<()>;

    /// Number of live plain values whose key starts with `prefix`.
    async fn count_keys(&self, prefix: &str) -> Result<u64>;

    /// Delete expired plain values. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}
