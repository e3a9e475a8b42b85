//! canopy-sat - Satellite Biomass Estimation Service
//!
//! Turns "estimate biomass for plot P over [start, end]" into a persisted,
//! versioned calculation record by orchestrating a remote-sensing extraction
//! job, ingesting its tabular output (or an operator-supplied file),
//! computing vegetation-index statistics and a biomass/carbon regression.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::SatConfig;
use crate::services::AppEearsClient;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Resolved service configuration
    pub config: Arc<SatConfig>,
    /// Cancellation tokens for active automated runs, keyed by record id
    pub cancellation_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last background-task error, for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(db: SqlitePool, config: SatConfig) -> Self {
        Self {
            db,
            config: Arc::new(config),
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Build an extraction client from the configured credentials.
    ///
    /// Credentials are optional at startup so the manual submission path
    /// stays usable on deployments without an EarthData account.
    pub fn extraction_client(&self) -> ApiResult<AppEearsClient> {
        let credentials = self.config.credentials.as_ref().ok_or_else(|| {
            ApiError::Internal(
                "EarthData credentials not configured; set CANOPY_EARTHDATA_USERNAME and CANOPY_EARTHDATA_PASSWORD".to_string(),
            )
        })?;

        Ok(AppEearsClient::new(
            self.config.base_url.as_str(),
            credentials.username.as_str(),
            credentials.password.as_str(),
            self.config.request_timeout,
        )?)
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::calculation_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
