//! Postgres connection pool and schema bootstrap.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// DDL for `schemas`, `applications` and `pdp_jobs`.
pub const SCHEMA: &str = include_str!("../migrations/0001_portal_outbox.sql");

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Open a pool against `config.url`.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(config.url.trim())
        .await
}

/// Create the tables and indexes if they do not exist yet.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_every_table_idempotently() {
        for table in ["schemas", "applications", "pdp_jobs"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
        assert!(!SCHEMA.contains("CREATE TABLE pdp_jobs"));
        assert!(SCHEMA.contains("CREATE INDEX IF NOT EXISTS idx_pdp_jobs_claim"));
    }
}
