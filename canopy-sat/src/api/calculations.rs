//! Calculation API handlers
//!
//! POST /calculations, result-file submission, automated run control, and
//! the read endpoints the dashboard polls.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{CalculationRecord, CalculationState, SeriesPoint};
use crate::services::estimator;
use crate::services::orchestrator::{self, CalculationRequest, PollPolicy};
use crate::services::ExtractionProvider;
use crate::AppState;

fn default_model() -> String {
    "ndvi_foody2003".to_string()
}

fn default_carbon_factor() -> f64 {
    estimator::DEFAULT_CARBON_FACTOR
}

/// POST /calculations request
#[derive(Debug, Deserialize)]
pub struct CreateCalculationRequest {
    pub plot_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    #[serde(default = "default_model")]
    pub estimation_model: String,
    #[serde(default = "default_carbon_factor")]
    pub carbon_factor: f64,
}

/// GET /calculations/{id}/status response
#[derive(Debug, Serialize)]
pub struct CalculationStatusResponse {
    pub id: Uuid,
    pub plot_id: Uuid,
    pub remote_job_id: Option<String>,
    pub state: CalculationState,
    /// Coarse state-derived estimate (0/50/100), not a true measurement
    pub progress_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Aggregates attached to the time-series response
#[derive(Debug, Serialize)]
pub struct SeriesAggregates {
    pub ndvi_mean: Option<f64>,
    pub ndvi_min: Option<f64>,
    pub ndvi_max: Option<f64>,
    pub evi_mean: Option<f64>,
    pub observation_count: Option<i64>,
    pub cloud_fraction_pct: Option<f64>,
    pub quality_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<&'static str>,
}

/// GET /calculations/{id}/series response
#[derive(Debug, Serialize)]
pub struct TimeSeriesResponse {
    pub id: Uuid,
    pub plot_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub points: Vec<SeriesPoint>,
    pub aggregates: SeriesAggregates,
}

/// POST /calculations/{id}/run response
#[derive(Debug, Serialize)]
pub struct RunCalculationResponse {
    pub id: Uuid,
    pub message: String,
}

/// POST /calculations/{id}/cancel response
#[derive(Debug, Serialize)]
pub struct CancelCalculationResponse {
    pub id: Uuid,
    pub cancelled: bool,
}

/// GET /products response
#[derive(Debug, Serialize)]
pub struct ProductCatalogResponse {
    pub products: Vec<serde_json::Value>,
}

/// POST /calculations
///
/// Accept a calculation request. Returns 200 with the cached record when an
/// identical completed calculation exists, 201 with a fresh record
/// otherwise. The fresh record's state reflects the immediate outcome of
/// remote job creation (`awaiting_input` or `error`).
pub async fn create_calculation(
    State(state): State<AppState>,
    Json(request): Json<CreateCalculationRequest>,
) -> ApiResult<(StatusCode, Json<CalculationRecord>)> {
    if !(0.0..=1.0).contains(&request.carbon_factor) || request.carbon_factor == 0.0 {
        return Err(ApiError::BadRequest(format!(
            "carbon factor must be in (0, 1], got {}",
            request.carbon_factor
        )));
    }

    // A missing or misconfigured provider is not an HTTP failure here: the
    // record is still created and ends in the error state, so the outcome
    // stays visible to the caller.
    let client = state.extraction_client().ok();
    let provider = client.as_ref().map(|c| c as &dyn ExtractionProvider);
    let (record, cached) = orchestrator::request_calculation(
        &state,
        provider,
        CalculationRequest {
            plot_id: request.plot_id,
            period_start: request.period_start,
            period_end: request.period_end,
            estimation_model: request.estimation_model,
            carbon_factor: request.carbon_factor,
        },
    )
    .await?;

    let status = if cached {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(record)))
}

/// POST /calculations/{id}/result-file
///
/// Ingest the result file the operator downloaded from the extraction
/// provider. Raw CSV bytes in the request body.
pub async fn submit_result_file(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<CalculationRecord>> {
    let record = orchestrator::submit_result_file(&state, record_id, &body).await?;
    Ok(Json(record))
}

/// POST /calculations/{id}/run
///
/// Start the automated poll-and-ingest path in a background task. Returns
/// 202 immediately; progress is observable through the status endpoint.
pub async fn run_calculation(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<RunCalculationResponse>)> {
    let record = crate::db::calculations::load(&state.db, record_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Calculation not found: {}", record_id)))?;

    if record.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Calculation is already in terminal state '{}'",
            record.state.as_str()
        )));
    }

    let client = state.extraction_client()?;
    let policy = PollPolicy {
        max_attempts: state.config.poll_max_attempts,
        interval: state.config.poll_interval,
    };

    let cancel = CancellationToken::new();
    {
        let mut tokens = state.cancellation_tokens.write().await;
        if tokens.contains_key(&record_id) {
            return Err(ApiError::Conflict(
                "An automated run is already in progress for this calculation".to_string(),
            ));
        }
        tokens.insert(record_id, cancel.clone());
    }

    let state_clone = state.clone();
    tokio::spawn(async move {
        let result =
            orchestrator::drive_to_completion(&state_clone, &client, record_id, policy, cancel)
                .await;
        state_clone.cancellation_tokens.write().await.remove(&record_id);

        match result {
            Ok(record) => {
                tracing::info!(
                    record_id = %record_id,
                    state = record.state.as_str(),
                    "Automated run finished"
                );
            }
            Err(e) => {
                tracing::error!(record_id = %record_id, error = %e, "Automated run failed");
                *state_clone.last_error.write().await = Some(e.to_string());
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(RunCalculationResponse {
            id: record_id,
            message: "Automated processing started".to_string(),
        }),
    ))
}

/// POST /calculations/{id}/cancel
///
/// Signal the automated run for this record to abort; the record ends in
/// the error state with a "cancelled" message.
pub async fn cancel_calculation(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<CancelCalculationResponse>> {
    let tokens = state.cancellation_tokens.read().await;
    let Some(token) = tokens.get(&record_id) else {
        return Err(ApiError::Conflict(
            "No automated run in progress for this calculation".to_string(),
        ));
    };

    token.cancel();
    tracing::info!(record_id = %record_id, "Cancellation requested");

    Ok(Json(CancelCalculationResponse {
        id: record_id,
        cancelled: true,
    }))
}

/// GET /calculations/{id}
pub async fn get_calculation(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<CalculationRecord>> {
    let record = crate::db::calculations::load(&state.db, record_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Calculation not found: {}", record_id)))?;

    Ok(Json(record))
}

/// DELETE /calculations/{id}
pub async fn delete_calculation(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let deleted = crate::db::calculations::delete(&state.db, record_id).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!(
            "Calculation not found: {}",
            record_id
        )));
    }

    Ok(StatusCode::NO_CONTENT)
}

/// GET /calculations/{id}/status
pub async fn get_status(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<CalculationStatusResponse>> {
    let record = crate::db::calculations::load(&state.db, record_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Calculation not found: {}", record_id)))?;

    let message = match record.state {
        CalculationState::Pending => Some("Calculation queued".to_string()),
        CalculationState::AwaitingInput => Some(
            "Remote extraction job created; submit the downloaded result file to finish"
                .to_string(),
        ),
        CalculationState::Running => {
            Some("Processing satellite imagery; this can take 10-30 minutes".to_string())
        }
        CalculationState::Completed => record
            .ndvi_mean
            .map(|ndvi| format!("Calculation complete; mean NDVI {:.2}", ndvi)),
        CalculationState::Error => None,
    };

    let progress_pct = record.progress_pct();
    Ok(Json(CalculationStatusResponse {
        id: record.id,
        plot_id: record.plot_id,
        remote_job_id: record.remote_job_id,
        state: record.state,
        progress_pct,
        message,
        error_message: record.error_message,
    }))
}

/// GET /calculations/{id}/series
///
/// The full persisted time series plus aggregates. Records without a series
/// (failed, still in flight, or imported before series storage existed)
/// return 404.
pub async fn get_series(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<TimeSeriesResponse>> {
    let record = crate::db::calculations::load(&state.db, record_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Calculation not found: {}", record_id)))?;

    let Some(points) = record.time_series else {
        return Err(ApiError::NotFound(format!(
            "Calculation {} has no stored time series",
            record_id
        )));
    };

    Ok(Json(TimeSeriesResponse {
        id: record.id,
        plot_id: record.plot_id,
        period_start: record.period_start,
        period_end: record.period_end,
        points,
        aggregates: SeriesAggregates {
            ndvi_mean: record.ndvi_mean,
            ndvi_min: record.ndvi_min,
            ndvi_max: record.ndvi_max,
            evi_mean: record.evi_mean,
            observation_count: record.observation_count,
            cloud_fraction_pct: record.cloud_fraction_pct,
            quality_label: record.quality_label,
            interpretation: record.ndvi_mean.map(estimator::interpret_ndvi),
        },
    }))
}

/// GET /plots/{plot_id}/calculations
pub async fn list_for_plot(
    State(state): State<AppState>,
    Path(plot_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CalculationRecord>>> {
    let records = crate::db::calculations::list_for_plot(&state.db, plot_id).await?;
    Ok(Json(records))
}

/// GET /plots/{plot_id}/calculations/latest
pub async fn latest_for_plot(
    State(state): State<AppState>,
    Path(plot_id): Path<Uuid>,
) -> ApiResult<Json<CalculationRecord>> {
    let record = crate::db::calculations::latest_completed(&state.db, plot_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("No completed calculations for plot {}", plot_id))
        })?;

    Ok(Json(record))
}

/// GET /products
///
/// Passthrough to the extraction provider's product catalog.
pub async fn list_products(
    State(state): State<AppState>,
) -> ApiResult<Json<ProductCatalogResponse>> {
    let client = state.extraction_client()?;
    let products = client.list_products().await?;
    Ok(Json(ProductCatalogResponse { products }))
}

/// Build calculation routes
pub fn calculation_routes() -> Router<AppState> {
    Router::new()
        .route("/calculations", post(create_calculation))
        .route(
            "/calculations/:id",
            get(get_calculation).delete(delete_calculation),
        )
        .route("/calculations/:id/status", get(get_status))
        .route("/calculations/:id/series", get(get_series))
        .route("/calculations/:id/result-file", post(submit_result_file))
        .route("/calculations/:id/run", post(run_calculation))
        .route("/calculations/:id/cancel", post(cancel_calculation))
        .route("/plots/:plot_id/calculations", get(list_for_plot))
        .route("/plots/:plot_id/calculations/latest", get(latest_for_plot))
        .route("/products", get(list_products))
}
