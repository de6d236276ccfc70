//! Database initialization
//!
//! Opens (or creates) the SQLite catalog database, enables WAL so concurrent
//! per-image sessions read consistent snapshots while one writer commits,
//! creates the catalog tables and applies pending migrations.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default busy timeout; kept short so lock contention surfaces as a
/// retryable write conflict instead of stalling a worker
const DEFAULT_LOCK_RETRY_MS: i64 = 250;

const MAX_CONNECTIONS: u32 = 20;

/// Initialize database connection and create tables if needed
///
/// Schema setup runs on a single setup connection with the driver's default
/// busy timeout, so concurrent initializers wait for each other. The returned
/// pool applies `db_lock_retry_ms` to every connection it opens.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // WAL: readers keep their snapshot while another session commits
    let base_options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let setup = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(base_options.clone())
        .await?;

    if newly_created {
        info!("Initialized new catalog database: {}", db_path.display());
    } else {
        info!("Opened existing catalog database: {}", db_path.display());
    }

    create_schema_version_table(&setup).await?;
    create_settings_table(&setup).await?;
    create_assoc_source_table(&setup).await?;
    create_assoc_detection_table(&setup).await?;
    create_processed_image_table(&setup).await?;
    create_reference_source_table(&setup).await?;

    crate::db::migrations::run_migrations(&setup).await?;

    init_default_settings(&setup).await?;

    let timeout_ms = lock_retry_ms(&setup).await?;
    setup.close().await;

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .min_connections(2)
        .connect_with(base_options.busy_timeout(Duration::from_millis(timeout_ms)))
        .await?;

    info!("Database busy timeout set to {} ms", timeout_ms);

    Ok(pool)
}

/// Configured busy timeout; negative values fall back to the default
async fn lock_retry_ms(pool: &SqlitePool) -> Result<u64> {
    let value: Option<i64> = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'db_lock_retry_ms'",
    )
    .fetch_optional(pool)
    .await?;

    let ms = value.unwrap_or(DEFAULT_LOCK_RETRY_MS);
    match u64::try_from(ms) {
        Ok(ms) => Ok(ms),
        Err(_) => {
            warn!(
                "Invalid db_lock_retry_ms {}, using default {}",
                ms, DEFAULT_LOCK_RETRY_MS
            );
            Ok(DEFAULT_LOCK_RETRY_MS as u64)
        }
    }
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores operational key-value pairs (lock timeouts).
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the assoc_source table
///
/// One row per unique source within one configuration/beam class. `version`
/// is bumped on every committed update and checked by optimistic writers.
pub async fn create_assoc_source_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assoc_source (
            id TEXT PRIMARY KEY,
            ra REAL NOT NULL,
            e_ra REAL NOT NULL,
            dec REAL NOT NULL,
            e_dec REAL NOT NULL,
            maj REAL NOT NULL,
            e_maj REAL NOT NULL,
            min REAL NOT NULL,
            e_min REAL NOT NULL,
            pa REAL NOT NULL,
            e_pa REAL NOT NULL,
            flux REAL NOT NULL,
            e_flux REAL NOT NULL,
            config_key TEXT NOT NULL,
            beam REAL NOT NULL,
            num_detections INTEGER NOT NULL CHECK (num_detections >= 1),
            num_nulls INTEGER NOT NULL DEFAULT 0 CHECK (num_nulls >= 0),
            catalog_id TEXT,
            match_id TEXT,
            min_deruiter REAL,
            catalogs_checked TEXT NOT NULL DEFAULT '[]',
            matched_catalogs TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assoc_source_dec ON assoc_source(dec)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the assoc_detection table
///
/// Ordered contribution list of each source. The primary key guarantees a
/// detection is merged into at most one source.
pub async fn create_assoc_detection_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assoc_detection (
            detection_id TEXT PRIMARY KEY,
            assoc_id TEXT NOT NULL REFERENCES assoc_source(id) ON DELETE CASCADE,
            seq INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_assoc_detection_assoc ON assoc_detection(assoc_id, seq)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_processed_image_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_image (
            image_id TEXT PRIMARY KEY,
            num_detections INTEGER NOT NULL DEFAULT 0,
            processed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the reference_source table (populated by an external loader)
pub async fn create_reference_source_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reference_source (
            catalog TEXT NOT NULL,
            source_id TEXT NOT NULL,
            ra REAL NOT NULL,
            e_ra REAL NOT NULL,
            dec REAL NOT NULL,
            e_dec REAL NOT NULL,
            PRIMARY KEY (catalog, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    ensure_setting(pool, "db_lock_retry_ms", &DEFAULT_LOCK_RETRY_MS.to_string()).await?;
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting exists but has a NULL value, it is reset to the default.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // INSERT OR IGNORE: concurrent initializers may both pass the check
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}
