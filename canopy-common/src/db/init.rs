//! Database initialization
//!
//! Opens (or creates) the SQLite database, applies the pragmas the services
//! rely on, and creates all tables idempotently.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL mode allows concurrent readers while the background calculation
    // task writes state transitions
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    // Schema creation (idempotent - safe to call multiple times)
    create_settings_table(&pool).await?;
    create_plots_table(&pool).await?;
    create_satellite_calculations_table(&pool).await?;

    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create the settings table
///
/// Stores application configuration key-value pairs.
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

/// Create the plots table
///
/// Holds the monitoring plots the estimation pipeline operates on. Only the
/// fields the pipeline itself needs live here: the four boundary vertices
/// (a plot with any vertex missing cannot be submitted for extraction) and
/// the plot area used to scale per-hectare figures.
pub async fn create_plots_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plots (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            vertex1_lat REAL,
            vertex1_lon REAL,
            vertex2_lat REAL,
            vertex2_lon REAL,
            vertex3_lat REAL,
            vertex3_lon REAL,
            vertex4_lat REAL,
            vertex4_lon REAL,
            area_hectares REAL NOT NULL DEFAULT 0.1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (area_hectares > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_plots_name ON plots(name)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the satellite_calculations table
///
/// One row per estimation request attempt. Aggregate and result columns stay
/// NULL until the record reaches the completed state; the time series is a
/// serialized JSON list re-parsed on read.
pub async fn create_satellite_calculations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS satellite_calculations (
            id TEXT PRIMARY KEY,
            plot_id TEXT NOT NULL REFERENCES plots(id) ON DELETE CASCADE,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'awaiting_input', 'running', 'completed', 'error')),
            remote_job_id TEXT,
            estimation_model TEXT NOT NULL,
            carbon_factor REAL NOT NULL DEFAULT 0.47,
            error_message TEXT,
            data_source TEXT,
            product TEXT,
            ndvi_mean REAL,
            ndvi_min REAL,
            ndvi_max REAL,
            ndvi_std REAL,
            evi_mean REAL,
            evi_min REAL,
            evi_max REAL,
            cloud_fraction_pct REAL,
            observation_count INTEGER,
            quality_label TEXT,
            biomass_tonnes REAL,
            biomass_per_hectare REAL,
            carbon_tonnes REAL,
            carbon_per_hectare REAL,
            time_series TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (period_start <= period_end),
            CHECK (observation_count IS NULL OR observation_count >= 0),
            CHECK (cloud_fraction_pct IS NULL OR (cloud_fraction_pct >= 0 AND cloud_fraction_pct <= 100))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_satcalc_plot ON satellite_calculations(plot_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_satcalc_state ON satellite_calculations(state)")
        .execute(pool)
        .await?;

    // Two live requests for the same plot, period and model would race each
    // other to the remote service; the second insert fails instead. Error
    // records are excluded so a failed attempt can be retried with a fresh
    // record.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uniq_satcalc_request
        ON satellite_calculations(plot_id, period_start, period_end, estimation_model)
        WHERE state != 'error'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures all required settings exist with default values.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Remote extraction polling budget: 60 attempts x 30s = 30 minute ceiling
    ensure_setting(pool, "sat_poll_max_attempts", "60").await?;
    ensure_setting(pool, "sat_poll_interval_secs", "30").await?;

    // Per-request network timeout, independent of the polling budget
    ensure_setting(pool, "sat_request_timeout_ms", "30000").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // INSERT OR IGNORE handles concurrent initialization races
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

        tracing::warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

/// Read a setting value, falling back to the given default when absent.
pub async fn get_setting_or(pool: &SqlitePool, key: &str, default_value: &str) -> Result<String> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?
        .flatten();

    Ok(value.unwrap_or_else(|| default_value.to_string()))
}
