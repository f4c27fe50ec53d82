//! SQLite-backed [`KvStore`] implementation.
//!
//! Maps each command onto three tables created by
//! [`migrate::create_schema`](crate::migrate::create_schema): `kv_sets`,
//! `kv_hashes` and `kv_values`. Expiry is stored as an absolute unix
//! timestamp and filtered on read.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::KvStore;
use crate::config::Config;
use crate::{db, migrate};

/// Keep `IN (...)` lists well under SQLite's bound-parameter limit.
const MAX_BIND: usize = 500;

/// SQLite implementation of the [`KvStore`] trait.
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::create_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> =
            sqlx::query_scalar("SELECT member FROM kv_sets WHERE key = ? ORDER BY member")
                .bind(key)
                .fetch_all(&self.pool)
                .await?;
        Ok(members)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0u64;
        for member in members {
            let result = sqlx::query("INSERT OR IGNORE INTO kv_sets (key, member) VALUES (?, ?)")
                .bind(key)
                .bind(member)
                .execute(&mut *tx)
                .await?;
            added += result.rows_affected();
        }
        tx.commit().await?;
        Ok(added)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT field, value FROM kv_hashes WHERE key = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("field")?, row.try_get("value")?);
        }
        Ok(out)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_hashes WHERE key = ? AND field = ?")
                .bind(key)
                .bind(field)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn hash_get_many(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let mut found: HashMap<String, String> = HashMap::new();

        for chunk in fields.chunks(MAX_BIND) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT field, value FROM kv_hashes WHERE key = ");
            qb.push_bind(key);
            qb.push(" AND field IN (");
            let mut sep = qb.separated(", ");
            for field in chunk {
                sep.push_bind(field);
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                found.insert(row.try_get("field")?, row.try_get("value")?);
            }
        }

        Ok(fields.iter().map(|f| found.get(f).cloned()).collect())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_hashes (key, field, value) VALUES (?, ?, ?)
            ON CONFLICT(key, field) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let now = now_ts();
        let mut found: HashMap<String, String> = HashMap::new();

        for chunk in keys.chunks(MAX_BIND) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT key, value FROM kv_values WHERE (expires_at IS NULL OR expires_at > ");
            qb.push_bind(now);
            qb.push(") AND key IN (");
            let mut sep = qb.separated(", ");
            for key in chunk {
                sep.push_bind(key);
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                found.insert(row.try_get("key")?, row.try_get("value")?);
            }
        }

        Ok(keys.iter().map(|k| found.get(k).cloned()).collect())
    }

    async fn set_many_with_expiry(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let expires_at = now_ts() + ttl.as_secs() as i64;

        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO kv_values (key, value, expires_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_keys(&self, prefix: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM kv_values WHERE substr(key, 1, length(?)) = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(prefix)
        .bind(prefix)
        .bind(now_ts())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM kv_values WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_ts())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
