mod models;
pub mod query;

pub use models::*;

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::config::DatabaseConfig;

pub type DbPool = SqlitePool;

/// Whether `err` is a UNIQUE constraint violation
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint failed")
    )
}

/// Execute a SQL migration file, properly handling comments
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        // Strip SQL comment lines (lines starting with --)
        let cleaned: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

pub async fn init(config: &DatabaseConfig) -> Result<DbPool> {
    info!("Initializing database at {}", config.url);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    // Enable WAL mode for better concurrency
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// Single-connection in-memory database with the full schema.
///
/// Every connection to `sqlite::memory:` opens a fresh database, so the pool
/// is pinned to one connection that is never recycled.
pub async fn init_memory() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply all schema migrations. Every statement is idempotent, so this runs on
/// each startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    // Migration 001: Organizations, users, sessions, audit logs
    execute_sql(pool, include_str!("../../migrations/001_tenancy.sql")).await?;

    // Migration 002: Compliance tables
    execute_sql(pool, include_str!("../../migrations/002_compliance.sql")).await?;

    // Migration 003: Templates, flags, webhooks, releases, rules
    execute_sql(pool, include_str!("../../migrations/003_operations.sql")).await?;

    // Migration 004: Threats, health scores, pipelines
    execute_sql(pool, include_str!("../../migrations/004_monitoring.sql")).await?;

    info!("Migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(n,)| n).collect();

        for expected in [
            "attestations",
            "audit_logs",
            "compliance_audits",
            "data_exports",
            "email_templates",
            "feature_flags",
            "health_scores",
            "organizations",
            "pipeline_runs",
            "pipelines",
            "releases",
            "retention_policies",
            "rules",
            "security_threats",
            "sessions",
            "users",
            "webhook_deliveries",
            "webhooks",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing table {}", expected);
        }
    }
}
