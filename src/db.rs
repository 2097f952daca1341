//! SQLite bootstrap: pool creation and the embedded schema.

use anyhow::{Context, Result};
use sqlx::{SqlitePool, migrate::Migrator, sqlite::SqlitePoolOptions};
use std::path::Path;

/// Schema files under `migrations/`, embedded at build time.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open the pool, creating the database file (and its directory) if needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    tracing::debug!("Connecting using raw URL => {}", database_url);

    if !database_url.contains(":memory:") {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        tracing::debug!("Interpreted SQLite path => {}", db_path);

        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
        if let Err(e) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)
        {
            tracing::warn!("Failed to open database file manually: {}", e);
        }
    }

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .with_context(|| format!("connecting to {}", database_url))
}

/// Apply pending migrations. Versions already recorded are skipped.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    tracing::info!("Running {} migrations...", MIGRATOR.iter().count());
    MIGRATOR
        .run(db)
        .await
        .context("applying database migrations")?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    // One connection: every new in-memory connection is a fresh database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
