//! Calculation record persistence
//!
//! One row per request attempt. `save` is an upsert keyed on the record id,
//! so state transitions rewrite the whole row; the partial unique index on
//! (plot, period, model) for non-error states still rejects a second live
//! attempt for the same request.

use canopy_common::{Error, Result};
use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::models::{CalculationRecord, CalculationState, SeriesPoint};

/// Insert or update a calculation record
pub async fn save(pool: &SqlitePool, record: &CalculationRecord) -> Result<()> {
    // Prepare serialized fields before touching the pool
    let time_series = record
        .time_series
        .as_ref()
        .map(|points| serde_json::to_string(points))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to serialize time series: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO satellite_calculations (
            id, plot_id, period_start, period_end, state, remote_job_id,
            estimation_model, carbon_factor, error_message, data_source, product,
            ndvi_mean, ndvi_min, ndvi_max, ndvi_std,
            evi_mean, evi_min, evi_max,
            cloud_fraction_pct, observation_count, quality_label,
            biomass_tonnes, biomass_per_hectare, carbon_tonnes, carbon_per_hectare,
            time_series, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            remote_job_id = excluded.remote_job_id,
            error_message = excluded.error_message,
            data_source = excluded.data_source,
            product = excluded.product,
            ndvi_mean = excluded.ndvi_mean,
            ndvi_min = excluded.ndvi_min,
            ndvi_max = excluded.ndvi_max,
            ndvi_std = excluded.ndvi_std,
            evi_mean = excluded.evi_mean,
            evi_min = excluded.evi_min,
            evi_max = excluded.evi_max,
            cloud_fraction_pct = excluded.cloud_fraction_pct,
            observation_count = excluded.observation_count,
            quality_label = excluded.quality_label,
            biomass_tonnes = excluded.biomass_tonnes,
            biomass_per_hectare = excluded.biomass_per_hectare,
            carbon_tonnes = excluded.carbon_tonnes,
            carbon_per_hectare = excluded.carbon_per_hectare,
            time_series = excluded.time_series,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.plot_id.to_string())
    .bind(record.period_start.format("%Y-%m-%d").to_string())
    .bind(record.period_end.format("%Y-%m-%d").to_string())
    .bind(record.state.as_str())
    .bind(&record.remote_job_id)
    .bind(&record.estimation_model)
    .bind(record.carbon_factor)
    .bind(&record.error_message)
    .bind(&record.data_source)
    .bind(&record.product)
    .bind(record.ndvi_mean)
    .bind(record.ndvi_min)
    .bind(record.ndvi_max)
    .bind(record.ndvi_std)
    .bind(record.evi_mean)
    .bind(record.evi_min)
    .bind(record.evi_max)
    .bind(record.cloud_fraction_pct)
    .bind(record.observation_count)
    .bind(&record.quality_label)
    .bind(record.biomass_tonnes)
    .bind(record.biomass_per_hectare)
    .bind(record.carbon_tonnes)
    .bind(record.carbon_per_hectare)
    .bind(time_series)
    .bind(record.created_at.to_rfc3339())
    .bind(record.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a calculation record by id
pub async fn load(pool: &SqlitePool, record_id: Uuid) -> Result<Option<CalculationRecord>> {
    let row = sqlx::query("SELECT * FROM satellite_calculations WHERE id = ?")
        .bind(record_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| from_row(&r)).transpose()
}

/// Cache lookup: a completed record for the same plot, period and model.
pub async fn find_completed(
    pool: &SqlitePool,
    plot_id: Uuid,
    period_start: NaiveDate,
    period_end: NaiveDate,
    estimation_model: &str,
) -> Result<Option<CalculationRecord>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM satellite_calculations
        WHERE plot_id = ? AND period_start = ? AND period_end = ?
          AND estimation_model = ? AND state = 'completed'
        LIMIT 1
        "#,
    )
    .bind(plot_id.to_string())
    .bind(period_start.format("%Y-%m-%d").to_string())
    .bind(period_end.format("%Y-%m-%d").to_string())
    .bind(estimation_model)
    .fetch_optional(pool)
    .await?;

    row.map(|r| from_row(&r)).transpose()
}

/// All calculations for a plot, newest first
pub async fn list_for_plot(pool: &SqlitePool, plot_id: Uuid) -> Result<Vec<CalculationRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM satellite_calculations WHERE plot_id = ? ORDER BY created_at DESC",
    )
    .bind(plot_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(from_row).collect()
}

/// Most recent completed calculation for a plot
pub async fn latest_completed(
    pool: &SqlitePool,
    plot_id: Uuid,
) -> Result<Option<CalculationRecord>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM satellite_calculations
        WHERE plot_id = ? AND state = 'completed'
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(plot_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|r| from_row(&r)).transpose()
}

/// Delete a calculation record; returns false when it did not exist
pub async fn delete(pool: &SqlitePool, record_id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM satellite_calculations WHERE id = ?")
        .bind(record_id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn from_row(row: &SqliteRow) -> Result<CalculationRecord> {
    let id: String = row.get("id");
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::Internal(format!("Failed to parse calculation id: {}", e)))?;

    let plot_id: String = row.get("plot_id");
    let plot_id = Uuid::parse_str(&plot_id)
        .map_err(|e| Error::Internal(format!("Failed to parse plot id: {}", e)))?;

    let state: String = row.get("state");
    let state = CalculationState::parse(&state)
        .ok_or_else(|| Error::Internal(format!("Unknown calculation state: {}", state)))?;

    let period_start = parse_date(row.get("period_start"))?;
    let period_end = parse_date(row.get("period_end"))?;

    let time_series: Option<String> = row.get("time_series");
    let time_series: Option<Vec<SeriesPoint>> = time_series
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to deserialize time series: {}", e)))?;

    let created_at = parse_timestamp(row.get("created_at"))?;
    let updated_at = parse_timestamp(row.get("updated_at"))?;

    Ok(CalculationRecord {
        id,
        plot_id,
        period_start,
        period_end,
        state,
        remote_job_id: row.get("remote_job_id"),
        estimation_model: row.get("estimation_model"),
        carbon_factor: row.get("carbon_factor"),
        error_message: row.get("error_message"),
        data_source: row.get("data_source"),
        product: row.get("product"),
        ndvi_mean: row.get("ndvi_mean"),
        ndvi_min: row.get("ndvi_min"),
        ndvi_max: row.get("ndvi_max"),
        ndvi_std: row.get("ndvi_std"),
        evi_mean: row.get("evi_mean"),
        evi_min: row.get("evi_min"),
        evi_max: row.get("evi_max"),
        cloud_fraction_pct: row.get("cloud_fraction_pct"),
        observation_count: row.get("observation_count"),
        quality_label: row.get("quality_label"),
        biomass_tonnes: row.get("biomass_tonnes"),
        biomass_per_hectare: row.get("biomass_per_hectare"),
        carbon_tonnes: row.get("carbon_tonnes"),
        carbon_per_hectare: row.get("carbon_per_hectare"),
        time_series,
        created_at,
        updated_at,
    })
}

fn parse_date(raw: String) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| Error::Internal(format!("Failed to parse date '{}': {}", raw, e)))
}

fn parse_timestamp(raw: String) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", raw, e)))
}
