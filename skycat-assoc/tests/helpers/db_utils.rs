//! Database Test Utilities
//!
//! Temporary catalog databases for SQLite store tests

use anyhow::Result;
use skycat_assoc::SqliteCatalogStore;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Create temporary catalog database with migrations applied
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_catalog.db");
    let pool = skycat_common::db::init_database(&db_path).await?;
    Ok((temp_dir, pool))
}

/// Create temporary SQLite catalog store
pub async fn create_test_store() -> Result<(TempDir, SqliteCatalogStore)> {
    let (temp_dir, pool) = create_test_db().await?;
    Ok((temp_dir, SqliteCatalogStore::new(pool)))
}
