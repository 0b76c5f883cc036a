use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

const SCHEMA: &str = include_str!("../migrations/0001_analysis_engine.sql");

/// Workers hold at most one connection each, plus headroom for cancel checks and enqueues.
pub fn connect_lazy(database_url: &str, workers: usize) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections((workers as u32).saturating_mul(2).max(4))
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .context("failed to create lazy database pool")
}

/// Idempotent; every statement is `IF NOT EXISTS`.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply analysis engine schema")?;
    tracing::info!("analysis engine schema applied");
    Ok(())
}
