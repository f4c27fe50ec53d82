use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the key-value tables. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Set membership (vendors)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_sets (
            key TEXT NOT NULL,
            member TEXT NOT NULL,
            PRIMARY KEY (key, member)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Hashes (model mapping)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_hashes (
            key TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (key, field)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Plain values with optional expiry (location cache)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_values (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_values_expires_at ON kv_values(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}
