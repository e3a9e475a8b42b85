//! Calculation record state machine
//!
//! A calculation progresses through:
//! pending → awaiting_input → completed   (manual result-file submission)
//! pending → running → completed          (automated polling)
//! with `error` reachable from every non-terminal state. `completed` and
//! `error` are terminal; re-processing requires a fresh record.

use canopy_common::Error;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing state of a calculation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationState {
    /// Record created, remote job not yet submitted
    Pending,
    /// Remote job exists; waiting for a result file to be supplied
    AwaitingInput,
    /// Automated polling of the remote job in progress
    Running,
    /// All aggregates and results populated
    Completed,
    /// Terminal failure; see `error_message`
    Error,
}

impl CalculationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationState::Pending => "pending",
            CalculationState::AwaitingInput => "awaiting_input",
            CalculationState::Running => "running",
            CalculationState::Completed => "completed",
            CalculationState::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CalculationState::Pending),
            "awaiting_input" => Some(CalculationState::AwaitingInput),
            "running" => Some(CalculationState::Running),
            "completed" => Some(CalculationState::Completed),
            "error" => Some(CalculationState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CalculationState::Completed | CalculationState::Error)
    }

    /// Allowed transitions. Terminal states allow none.
    pub fn can_transition_to(&self, next: CalculationState) -> bool {
        use CalculationState::*;
        match (self, next) {
            (Pending, AwaitingInput) | (Pending, Running) | (Pending, Error) => true,
            (AwaitingInput, Running) | (AwaitingInput, Completed) | (AwaitingInput, Error) => true,
            (Running, Completed) | (Running, Error) => true,
            _ => false,
        }
    }
}

/// Per-point reliability tag assigned at ingestion time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTag {
    /// Both vegetation indices present and in range
    Good,
    /// At least one index missing for this date
    Cloudy,
}

/// One dated observation in the canonical series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ndvi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evi: Option<f64>,
    pub quality: QualityTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biomass: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carbon: Option<f64>,
}

impl SeriesPoint {
    pub fn new(date: NaiveDate, ndvi: Option<f64>, evi: Option<f64>) -> Self {
        let quality = if ndvi.is_some() && evi.is_some() {
            QualityTag::Good
        } else {
            QualityTag::Cloudy
        };
        Self {
            date,
            ndvi,
            evi,
            quality,
            biomass: None,
            carbon: None,
        }
    }
}

/// Persisted satellite calculation record
///
/// Mutated only by the orchestrator, always in whole-field transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationRecord {
    pub id: Uuid,
    pub plot_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub state: CalculationState,
    pub remote_job_id: Option<String>,
    pub estimation_model: String,
    pub carbon_factor: f64,
    pub error_message: Option<String>,
    pub data_source: Option<String>,
    pub product: Option<String>,
    pub ndvi_mean: Option<f64>,
    pub ndvi_min: Option<f64>,
    pub ndvi_max: Option<f64>,
    pub ndvi_std: Option<f64>,
    pub evi_mean: Option<f64>,
    pub evi_min: Option<f64>,
    pub evi_max: Option<f64>,
    pub cloud_fraction_pct: Option<f64>,
    pub observation_count: Option<i64>,
    pub quality_label: Option<String>,
    pub biomass_tonnes: Option<f64>,
    pub biomass_per_hectare: Option<f64>,
    pub carbon_tonnes: Option<f64>,
    pub carbon_per_hectare: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_series: Option<Vec<SeriesPoint>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalculationRecord {
    /// Create a new record in the pending state
    pub fn new(
        plot_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        estimation_model: String,
        carbon_factor: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plot_id,
            period_start,
            period_end,
            state: CalculationState::Pending,
            remote_job_id: None,
            estimation_model,
            carbon_factor,
            error_message: None,
            data_source: None,
            product: None,
            ndvi_mean: None,
            ndvi_min: None,
            ndvi_max: None,
            ndvi_std: None,
            evi_mean: None,
            evi_min: None,
            evi_max: None,
            cloud_fraction_pct: None,
            observation_count: None,
            quality_label: None,
            biomass_tonnes: None,
            biomass_per_hectare: None,
            carbon_tonnes: None,
            carbon_per_hectare: None,
            time_series: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new state; transitions out of terminal states and
    /// transitions not in the state diagram are rejected.
    pub fn transition_to(&mut self, next: CalculationState) -> canopy_common::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "invalid state transition {} -> {}",
                self.state.as_str(),
                next.as_str()
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Transition to `error` with a descriptive message
    pub fn fail(&mut self, message: impl Into<String>) -> canopy_common::Result<()> {
        self.transition_to(CalculationState::Error)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Coarse progress estimate derived purely from state, not a true
    /// measurement: 0 (pending), 50 (in flight), 100 (completed).
    pub fn progress_pct(&self) -> Option<u8> {
        match self.state {
            CalculationState::Pending => Some(0),
            CalculationState::AwaitingInput | CalculationState::Running => Some(50),
            CalculationState::Completed => Some(100),
            CalculationState::Error => None,
        }
    }
}
