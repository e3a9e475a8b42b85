//! Calculation orchestration
//!
//! The only component that mutates calculation records. Every mutation is a
//! whole-field transition followed by a save; the ingestion, estimation and
//! classification services return pure values and never touch storage.
//!
//! Two completion paths share one finalization step:
//! - manual: the operator downloads the provider's result file and submits
//!   it through the API (`submit_result_file`)
//! - automated: a spawned task polls the remote job to completion and
//!   downloads the result itself (`drive_to_completion`)

use chrono::NaiveDate;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{CalculationRecord, CalculationState, SeriesPoint, SeriesStats};
use crate::services::appeears_client::{default_products, ExtractionProvider, JobStatus};
use crate::services::{estimator, ingest, quality};
use crate::AppState;

/// Bounded polling budget for the automated path
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        // 60 x 30s: roughly the half hour the provider needs for small jobs
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(30),
        }
    }
}

/// Parameters of a calculation request
#[derive(Debug, Clone)]
pub struct CalculationRequest {
    pub plot_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub estimation_model: String,
    pub carbon_factor: f64,
}

/// Accept a calculation request.
///
/// Returns the record and whether it was served from cache. A completed
/// record for the same plot, period and model short-circuits the request;
/// no new remote job is created. Otherwise a fresh record is persisted and
/// a remote extraction job submitted; job-creation failure (including an
/// unavailable provider) is recorded on the returned record rather than
/// swallowed.
pub async fn request_calculation(
    state: &AppState,
    provider: Option<&dyn ExtractionProvider>,
    request: CalculationRequest,
) -> ApiResult<(CalculationRecord, bool)> {
    if request.period_start > request.period_end {
        return Err(ApiError::BadRequest(format!(
            "period start {} is after period end {}",
            request.period_start, request.period_end
        )));
    }

    let plot = db::plots::load_plot(&state.db, request.plot_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Plot not found: {}", request.plot_id)))?;

    // Cache check: best-effort, not a transactional lock. Two concurrent
    // misses are caught by the unique index at insert time below.
    if let Some(existing) = db::calculations::find_completed(
        &state.db,
        request.plot_id,
        request.period_start,
        request.period_end,
        &request.estimation_model,
    )
    .await?
    {
        info!(record_id = %existing.id, plot_id = %request.plot_id, "Returning cached calculation");
        return Ok((existing, true));
    }

    let vertices = plot.boundary_vertices().ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Plot {} does not have all four boundary vertices defined",
            plot.id
        ))
    })?;

    let mut record = CalculationRecord::new(
        request.plot_id,
        request.period_start,
        request.period_end,
        request.estimation_model,
        request.carbon_factor,
    );

    if let Err(e) = db::calculations::save(&state.db, &record).await {
        if e.is_unique_violation() {
            return Err(ApiError::Conflict(
                "A calculation for this plot, period and model is already in progress".to_string(),
            ));
        }
        return Err(e.into());
    }

    match provider {
        Some(provider) => {
            match provider
                .create_job(
                    plot.id,
                    vertices,
                    request.period_start,
                    request.period_end,
                    &default_products(),
                )
                .await
            {
                Ok(job_id) => {
                    info!(record_id = %record.id, job_id = %job_id, "Remote extraction job created");
                    record.remote_job_id = Some(job_id);
                    record.transition_to(CalculationState::AwaitingInput)?;
                }
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "Remote job creation failed");
                    record.fail(format!("Failed to create remote extraction job: {}", e))?;
                }
            }
        }
        None => {
            warn!(record_id = %record.id, "No extraction provider available");
            record.fail(
                "Remote extraction unavailable: EarthData credentials not configured",
            )?;
        }
    }

    db::calculations::save(&state.db, &record).await?;
    Ok((record, false))
}

/// Ingest an operator-supplied result file and complete the record.
///
/// Only records waiting for input accept a file; ingestion failure moves the
/// record to `error` and surfaces the cause to the caller.
pub async fn submit_result_file(
    state: &AppState,
    record_id: Uuid,
    bytes: &[u8],
) -> ApiResult<CalculationRecord> {
    let mut record = db::calculations::load(&state.db, record_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Calculation not found: {}", record_id)))?;

    if record.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Calculation is already in terminal state '{}'",
            record.state.as_str()
        )));
    }
    if record.state == CalculationState::Running {
        return Err(ApiError::Conflict(
            "An automated run is in progress for this calculation".to_string(),
        ));
    }
    if record.state == CalculationState::Pending {
        return Err(ApiError::Conflict(
            "No remote extraction job exists for this calculation yet".to_string(),
        ));
    }

    let series = match ingest::ingest_series(bytes) {
        Ok(series) => series,
        Err(e) => {
            record.fail(format!("Result file rejected: {}", e))?;
            db::calculations::save(&state.db, &record).await?;
            return Err(e.into());
        }
    };

    finalize(state, &mut record, series).await?;
    Ok(record)
}

/// Drive a record's remote job to completion with a bounded poll loop.
///
/// Runs in a spawned task; the requesting caller never waits on it. The
/// returned record carries the outcome: `completed` on success, `error` on
/// poll timeout, remote failure, missing result file, unparseable content
/// or cancellation. Only infrastructure failures (storage, missing record)
/// surface as `Err`.
pub async fn drive_to_completion(
    state: &AppState,
    provider: &dyn ExtractionProvider,
    record_id: Uuid,
    policy: PollPolicy,
    cancel: CancellationToken,
) -> ApiResult<CalculationRecord> {
    let mut record = db::calculations::load(&state.db, record_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Calculation not found: {}", record_id)))?;

    if record.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Calculation is already in terminal state '{}'",
            record.state.as_str()
        )));
    }

    record.transition_to(CalculationState::Running)?;
    db::calculations::save(&state.db, &record).await?;

    let Some(job_id) = record.remote_job_id.clone() else {
        return fail_record(state, record, "No remote extraction job associated with this calculation").await;
    };

    let mut done = false;
    for attempt in 1..=policy.max_attempts {
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                return fail_record(state, record, "cancelled").await;
            }
            status = provider.poll_status(&job_id) => status,
        };

        match status {
            Ok(JobStatus::Done) => {
                info!(record_id = %record.id, attempt, "Remote job finished");
                done = true;
                break;
            }
            Ok(JobStatus::Error) => {
                return fail_record(state, record, "Remote extraction job reported failure").await;
            }
            Ok(_) => {
                tracing::debug!(
                    record_id = %record.id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Remote job still in progress"
                );
                if attempt < policy.max_attempts {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return fail_record(state, record, "cancelled").await;
                        }
                        _ = tokio::time::sleep(policy.interval) => {}
                    }
                }
            }
            Err(e) => {
                return fail_record(state, record, format!("Remote status check failed: {}", e))
                    .await;
            }
        }
    }

    if !done {
        let message = format!(
            "Remote job did not complete within {} poll attempts",
            policy.max_attempts
        );
        return fail_record(state, record, message).await;
    }

    let files = match provider.list_result_files(&job_id).await {
        Ok(files) => files,
        Err(e) => {
            return fail_record(state, record, format!("Failed to list result files: {}", e))
                .await;
        }
    };

    // The bundle mixes data with previews and metadata; only the tabular
    // product export is usable here.
    let Some(file) = files
        .iter()
        .find(|f| f.file_name.ends_with(".csv") && f.file_name.contains("MOD13Q1"))
    else {
        return fail_record(
            state,
            record,
            "Result bundle contained no CSV file for the requested product",
        )
        .await;
    };

    let bytes = match provider.download_file(&job_id, &file.file_id).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return fail_record(state, record, format!("Result download failed: {}", e)).await;
        }
    };

    let series = match ingest::ingest_series(&bytes) {
        Ok(series) => series,
        Err(e) => {
            return fail_record(state, record, format!("Result file rejected: {}", e)).await;
        }
    };

    if let Err(e) = finalize(state, &mut record, series).await {
        warn!(record_id = %record.id, error = %e, "Finalization failed");
    }
    Ok(record)
}

/// Persist an error outcome and hand the record back.
async fn fail_record(
    state: &AppState,
    mut record: CalculationRecord,
    message: impl Into<String>,
) -> ApiResult<CalculationRecord> {
    let message = message.into();
    warn!(record_id = %record.id, "Calculation failed: {}", message);
    record.fail(message)?;
    db::calculations::save(&state.db, &record).await?;
    Ok(record)
}

/// Shared completion step for both ingestion paths.
///
/// Enriches the series with per-point biomass/carbon, computes aggregates
/// and quality, and persists the completed record. Validation failures
/// (no NDVI signal, mean outside the model's calibration range) persist an
/// `error` outcome before surfacing.
async fn finalize(
    state: &AppState,
    record: &mut CalculationRecord,
    mut series: Vec<SeriesPoint>,
) -> ApiResult<()> {
    let plot = db::plots::load_plot(&state.db, record.plot_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Plot not found: {}", record.plot_id)))?;
    let area = plot.area_hectares;

    let stats = SeriesStats::compute(&series);

    let Some(ndvi_mean) = stats.ndvi_mean else {
        let message = "Result contained no NDVI observations".to_string();
        record.fail(message.clone())?;
        db::calculations::save(&state.db, record).await?;
        return Err(ApiError::BadRequest(message));
    };

    let biomass_tonnes = match estimator::estimate_biomass(ndvi_mean, area) {
        Ok(biomass) => biomass,
        Err(e) => {
            let message = format!("Biomass estimation rejected the series: {}", e);
            record.fail(message.clone())?;
            db::calculations::save(&state.db, record).await?;
            return Err(ApiError::BadRequest(message));
        }
    };
    let carbon_tonnes = estimator::estimate_carbon(biomass_tonnes, record.carbon_factor);

    // Per-point estimates for the stored series; points whose NDVI falls
    // outside the model's [0, 1] calibration range keep the raw index only.
    for point in &mut series {
        if let Some(ndvi) = point.ndvi {
            if let Ok(biomass) = estimator::estimate_biomass(ndvi, area) {
                point.biomass = Some(biomass);
                point.carbon = Some(estimator::estimate_carbon(biomass, record.carbon_factor));
            }
        }
    }

    let (label, cloud_fraction_pct) = quality::classify(&series);

    record.ndvi_mean = Some(ndvi_mean);
    record.ndvi_min = stats.ndvi_min;
    record.ndvi_max = stats.ndvi_max;
    record.ndvi_std = stats.ndvi_std;
    record.evi_mean = stats.evi_mean;
    record.evi_min = stats.evi_min;
    record.evi_max = stats.evi_max;
    record.cloud_fraction_pct = Some(cloud_fraction_pct);
    record.observation_count = Some(series.len() as i64);
    record.quality_label = Some(label.as_str().to_string());
    record.biomass_tonnes = Some(biomass_tonnes);
    record.biomass_per_hectare = Some(biomass_tonnes / area);
    record.carbon_tonnes = Some(carbon_tonnes);
    record.carbon_per_hectare = Some(carbon_tonnes / area);
    record.data_source = Some("NASA_MODIS".to_string());
    record.product = Some("MOD13Q1.061".to_string());
    record.time_series = Some(series);
    record.transition_to(CalculationState::Completed)?;

    db::calculations::save(&state.db, record).await?;

    info!(
        record_id = %record.id,
        ndvi_mean = ndvi_mean,
        biomass_tonnes = biomass_tonnes,
        quality = label.as_str(),
        "Calculation completed"
    );

    Ok(())
}
