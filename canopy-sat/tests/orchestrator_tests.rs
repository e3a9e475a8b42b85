//! Orchestrator integration tests
//!
//! Runs the full request / submit / automated-drive paths against a real
//! SQLite database and a scripted extraction provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use canopy_sat::config::SatConfig;
use canopy_sat::db::plots::{insert_plot, Plot};
use canopy_sat::error::ApiError;
use canopy_sat::models::CalculationState;
use canopy_sat::services::appeears_client::{
    ExtractionProvider, FileDescriptor, JobStatus, ProductLayer, RemoteServiceError,
};
use canopy_sat::services::orchestrator::{
    drive_to_completion, request_calculation, submit_result_file, CalculationRequest, PollPolicy,
};
use canopy_sat::AppState;

/// Scripted extraction provider
struct FakeProvider {
    fail_create: bool,
    /// Status sequence; the last entry repeats once the script runs out
    statuses: Mutex<Vec<JobStatus>>,
    files: Vec<FileDescriptor>,
    file_bytes: Vec<u8>,
    create_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            fail_create: false,
            statuses: Mutex::new(vec![JobStatus::Done]),
            files: vec![FileDescriptor {
                file_id: "file-1".to_string(),
                file_name: "MOD13Q1-061-results.csv".to_string(),
                file_size: None,
            }],
            file_bytes: Vec::new(),
            create_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExtractionProvider for FakeProvider {
    async fn create_job(
        &self,
        _plot_id: Uuid,
        _vertices: [[f64; 2]; 4],
        _period_start: NaiveDate,
        _period_end: NaiveDate,
        _products: &[ProductLayer],
    ) -> Result<String, RemoteServiceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            Err(RemoteServiceError::Network("connection refused".to_string()))
        } else {
            Ok("job-1".to_string())
        }
    }

    async fn poll_status(&self, _job_id: &str) -> Result<JobStatus, RemoteServiceError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            Ok(statuses.remove(0))
        } else {
            Ok(statuses.first().copied().unwrap_or(JobStatus::Pending))
        }
    }

    async fn list_result_files(
        &self,
        _job_id: &str,
    ) -> Result<Vec<FileDescriptor>, RemoteServiceError> {
        Ok(self.files.clone())
    }

    async fn download_file(
        &self,
        _job_id: &str,
        _file_id: &str,
    ) -> Result<Vec<u8>, RemoteServiceError> {
        Ok(self.file_bytes.clone())
    }
}

fn full_plot() -> Plot {
    Plot {
        id: Uuid::new_v4(),
        name: "Amazon monitoring plot".to_string(),
        vertex1_lat: Some(-0.60),
        vertex1_lon: Some(-76.10),
        vertex2_lat: Some(-0.60),
        vertex2_lon: Some(-76.20),
        vertex3_lat: Some(-0.70),
        vertex3_lon: Some(-76.20),
        vertex4_lat: Some(-0.70),
        vertex4_lon: Some(-76.10),
        area_hectares: 0.1,
    }
}

fn test_config() -> SatConfig {
    SatConfig {
        base_url: "http://127.0.0.1:1/api".to_string(),
        credentials: None,
        request_timeout: Duration::from_secs(5),
        poll_max_attempts: 5,
        poll_interval: Duration::from_millis(5),
    }
}

async fn setup() -> (AppState, Uuid, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = canopy_common::db::init_database(&dir.path().join("canopy.db"))
        .await
        .expect("Failed to initialize database");

    let plot = full_plot();
    insert_plot(&pool, &plot).await.unwrap();

    (AppState::new(pool, test_config()), plot.id, dir)
}

fn request_for(plot_id: Uuid) -> CalculationRequest {
    CalculationRequest {
        plot_id,
        period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        period_end: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        estimation_model: "ndvi_foody2003".to_string(),
        carbon_factor: 0.47,
    }
}

/// Schema-A CSV: 12 dates, 10 with both indices in range, one with an
/// out-of-range NDVI but a valid EVI (kept as a cloudy point), one with an
/// out-of-range NDVI only (dropped entirely).
fn twelve_date_statistics_csv() -> String {
    let mut csv = String::from("File Name,Date,Mean\n");
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

    for i in 0u64..10 {
        let date = start + chrono::Days::new(16 * i);
        csv.push_str(&format!(
            "MOD13Q1.061__250m_16_days_NDVI,{date},0.7{}\n",
            i % 10
        ));
        csv.push_str(&format!(
            "MOD13Q1.061__250m_16_days_EVI,{date},0.5{}\n",
            i % 10
        ));
    }

    let date11 = start + chrono::Days::new(160);
    csv.push_str(&format!("MOD13Q1.061__250m_16_days_NDVI,{date11},20000\n"));
    csv.push_str(&format!("MOD13Q1.061__250m_16_days_EVI,{date11},0.50\n"));

    let date12 = start + chrono::Days::new(176);
    csv.push_str(&format!("MOD13Q1.061__250m_16_days_NDVI,{date12},30000\n"));

    csv
}

#[tokio::test]
async fn request_creates_record_awaiting_input() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, cached) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    assert!(!cached);
    assert_eq!(record.state, CalculationState::AwaitingInput);
    assert_eq!(record.remote_job_id.as_deref(), Some("job-1"));
    assert_eq!(fake.create_calls.load(Ordering::SeqCst), 1);

    // Persisted identically
    let stored = canopy_sat::db::calculations::load(&state.db, record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, CalculationState::AwaitingInput);
    assert_eq!(stored.remote_job_id.as_deref(), Some("job-1"));
}

#[tokio::test]
async fn unknown_plot_is_not_found_and_creates_nothing() {
    let (state, _plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let err = request_calculation(&state, Some(&fake), request_for(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
    assert_eq!(fake.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn incomplete_boundary_fails_before_any_record_or_job() {
    let (state, _plot_id, _dir) = setup().await;

    let mut partial = full_plot();
    partial.id = Uuid::new_v4();
    partial.vertex4_lon = None;
    insert_plot(&state.db, &partial).await.unwrap();

    let fake = FakeProvider::default();
    let err = request_calculation(&state, Some(&fake), request_for(partial.id))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::BadRequest(_)));
    assert_eq!(fake.create_calls.load(Ordering::SeqCst), 0);

    let records = canopy_sat::db::calculations::list_for_plot(&state.db, partial.id)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn inverted_period_is_rejected() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let mut request = request_for(plot_id);
    request.period_start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    request.period_end = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

    let err = request_calculation(&state, Some(&fake), request)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn job_creation_failure_ends_in_error_with_message() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider {
        fail_create: true,
        ..Default::default()
    };

    let (record, cached) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    assert!(!cached);
    assert_eq!(record.state, CalculationState::Error);
    let message = record.error_message.as_deref().unwrap();
    assert!(message.contains("connection refused"));
    assert!(record.biomass_tonnes.is_none());
    assert!(record.remote_job_id.is_none());
}

#[tokio::test]
async fn missing_provider_ends_in_error_not_http_failure() {
    let (state, plot_id, _dir) = setup().await;

    let (record, cached) = request_calculation(&state, None, request_for(plot_id))
        .await
        .unwrap();

    assert!(!cached);
    assert_eq!(record.state, CalculationState::Error);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .contains("credentials"));
}

#[tokio::test]
async fn duplicate_live_request_conflicts() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let err = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
}

#[tokio::test]
async fn submit_result_file_completes_the_record() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let updated = submit_result_file(&state, record.id, twelve_date_statistics_csv().as_bytes())
        .await
        .unwrap();

    assert_eq!(updated.state, CalculationState::Completed);
    assert_eq!(updated.observation_count, Some(11));

    // 10 dual-index points out of 11: ~9% cloud, which clears the top band
    let label = updated.quality_label.as_deref().unwrap();
    assert!(label == "excellent" || label == "good");
    let cloud = updated.cloud_fraction_pct.unwrap();
    assert!(cloud > 8.0 && cloud < 10.0);

    assert!(updated.biomass_tonnes.unwrap() > 0.0);
    assert!(updated.carbon_tonnes.unwrap() > 0.0);
    let ratio = updated.carbon_tonnes.unwrap() / updated.biomass_tonnes.unwrap();
    assert!((ratio - 0.47).abs() < 1e-9);

    assert!(updated.biomass_per_hectare.unwrap() > updated.biomass_tonnes.unwrap());
    assert_eq!(updated.data_source.as_deref(), Some("NASA_MODIS"));

    let series = updated.time_series.as_ref().unwrap();
    assert_eq!(series.len(), 11);
    // Per-point enrichment on NDVI-bearing points
    assert!(series[0].biomass.unwrap() > 0.0);
    // The out-of-range NDVI date survives as an EVI-only point
    let cloudy = series.iter().find(|p| p.ndvi.is_none()).unwrap();
    assert!(cloudy.evi.is_some());
    assert!(cloudy.biomass.is_none());
}

#[tokio::test]
async fn completed_record_is_served_from_cache() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();
    submit_result_file(&state, record.id, twelve_date_statistics_csv().as_bytes())
        .await
        .unwrap();

    // Identical request again, with a fresh provider: no new job
    let fake2 = FakeProvider::default();
    let (cached_record, cached) = request_calculation(&state, Some(&fake2), request_for(plot_id))
        .await
        .unwrap();

    assert!(cached);
    assert_eq!(cached_record.id, record.id);
    assert_eq!(fake2.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn submit_on_terminal_record_conflicts() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();
    submit_result_file(&state, record.id, twelve_date_statistics_csv().as_bytes())
        .await
        .unwrap();

    let err = submit_result_file(&state, record.id, b"File Name,Date,Mean\n")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
}

#[tokio::test]
async fn unparseable_submission_moves_record_to_error() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let err = submit_result_file(&state, record.id, b"timestamp,value\n2024-01-01,0.5\n")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let stored = canopy_sat::db::calculations::load(&state.db, record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, CalculationState::Error);
    assert!(stored.error_message.is_some());
    assert!(stored.biomass_tonnes.is_none());
}

#[tokio::test]
async fn drive_polls_to_completion_and_ingests() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let driver = FakeProvider {
        statuses: Mutex::new(vec![JobStatus::Pending, JobStatus::Running, JobStatus::Done]),
        files: vec![
            FileDescriptor {
                file_id: "file-0".to_string(),
                file_name: "browse.png".to_string(),
                file_size: None,
            },
            FileDescriptor {
                file_id: "file-1".to_string(),
                file_name: "MOD13Q1-061-results.csv".to_string(),
                file_size: None,
            },
        ],
        file_bytes: twelve_date_statistics_csv().into_bytes(),
        ..Default::default()
    };

    let policy = PollPolicy {
        max_attempts: 5,
        interval: Duration::from_millis(5),
    };
    let outcome = drive_to_completion(
        &state,
        &driver,
        record.id,
        policy,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.state, CalculationState::Completed);
    assert_eq!(driver.poll_calls.load(Ordering::SeqCst), 3);
    assert!(outcome.biomass_tonnes.unwrap() > 0.0);
}

#[tokio::test]
async fn drive_times_out_after_attempt_budget() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let driver = FakeProvider {
        statuses: Mutex::new(vec![JobStatus::Pending]),
        ..Default::default()
    };
    let policy = PollPolicy {
        max_attempts: 3,
        interval: Duration::from_millis(2),
    };

    let outcome = drive_to_completion(
        &state,
        &driver,
        record.id,
        policy,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.state, CalculationState::Error);
    let message = outcome.error_message.as_deref().unwrap();
    assert!(message.contains("3 poll attempts"));
    assert_eq!(driver.poll_calls.load(Ordering::SeqCst), 3);
    assert!(outcome.biomass_tonnes.is_none());
}

#[tokio::test]
async fn drive_surfaces_remote_job_failure() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let driver = FakeProvider {
        statuses: Mutex::new(vec![JobStatus::Error]),
        ..Default::default()
    };
    let outcome = drive_to_completion(
        &state,
        &driver,
        record.id,
        PollPolicy {
            max_attempts: 5,
            interval: Duration::from_millis(2),
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.state, CalculationState::Error);
    assert!(outcome
        .error_message
        .as_deref()
        .unwrap()
        .contains("reported failure"));
}

#[tokio::test]
async fn drive_fails_when_no_result_file_matches() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let driver = FakeProvider {
        files: vec![FileDescriptor {
            file_id: "file-0".to_string(),
            file_name: "granule-list.txt".to_string(),
            file_size: None,
        }],
        ..Default::default()
    };
    let outcome = drive_to_completion(
        &state,
        &driver,
        record.id,
        PollPolicy {
            max_attempts: 5,
            interval: Duration::from_millis(2),
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.state, CalculationState::Error);
    assert!(outcome
        .error_message
        .as_deref()
        .unwrap()
        .contains("no CSV file"));
}

#[tokio::test]
async fn drive_aborts_on_cancellation() {
    let (state, plot_id, _dir) = setup().await;
    let fake = FakeProvider::default();

    let (record, _) = request_calculation(&state, Some(&fake), request_for(plot_id))
        .await
        .unwrap();

    let driver = Arc::new(FakeProvider {
        statuses: Mutex::new(vec![JobStatus::Pending]),
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    let state_clone = state.clone();
    let driver_clone = driver.clone();
    let cancel_clone = cancel.clone();
    let record_id = record.id;
    let handle = tokio::spawn(async move {
        drive_to_completion(
            &state_clone,
            driver_clone.as_ref(),
            record_id,
            PollPolicy {
                max_attempts: 1000,
                interval: Duration::from_millis(50),
            },
            cancel_clone,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.state, CalculationState::Error);
    assert_eq!(outcome.error_message.as_deref(), Some("cancelled"));
}
