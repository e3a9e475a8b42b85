//! HTTP API integration tests
//!
//! Drives the axum router directly. The extraction provider is left
//! unconfigured, so these tests cover everything reachable without a
//! network: record creation outcomes, manual result-file submission, and
//! the read endpoints.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use std::time::Duration;
use tower::util::ServiceExt;
use uuid::Uuid;

use canopy_sat::config::SatConfig;
use canopy_sat::db::plots::{insert_plot, Plot};
use canopy_sat::models::{CalculationRecord, CalculationState};
use canopy_sat::AppState;

const RESULT_CSV: &str = "\
File Name,Date,Mean
MOD13Q1.061__250m_16_days_NDVI,2024-01-01,0.72
MOD13Q1.061__250m_16_days_EVI,2024-01-01,0.55
MOD13Q1.061__250m_16_days_NDVI,2024-01-17,0.68
MOD13Q1.061__250m_16_days_EVI,2024-01-17,0.51
MOD13Q1.061__250m_16_days_NDVI,2024-02-02,0.75
MOD13Q1.061__250m_16_days_EVI,2024-02-02,0.58
";

fn test_config() -> SatConfig {
    SatConfig {
        base_url: "http://127.0.0.1:1/api".to_string(),
        credentials: None,
        request_timeout: Duration::from_secs(5),
        poll_max_attempts: 3,
        poll_interval: Duration::from_millis(5),
    }
}

async fn create_test_app() -> (axum::Router, AppState, Uuid, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = canopy_common::db::init_database(&dir.path().join("canopy.db"))
        .await
        .expect("Failed to initialize database");

    let plot = Plot {
        id: Uuid::new_v4(),
        name: "API test plot".to_string(),
        vertex1_lat: Some(-0.60),
        vertex1_lon: Some(-76.10),
        vertex2_lat: Some(-0.60),
        vertex2_lon: Some(-76.20),
        vertex3_lat: Some(-0.70),
        vertex3_lon: Some(-76.20),
        vertex4_lat: Some(-0.70),
        vertex4_lon: Some(-76.10),
        area_hectares: 0.1,
    };
    insert_plot(&pool, &plot).await.unwrap();

    let state = AppState::new(pool, test_config());
    let app = canopy_sat::build_router(state.clone());

    (app, state, plot.id, dir)
}

/// Seed a record that is waiting for a result file, bypassing job creation.
async fn seed_awaiting_record(state: &AppState, plot_id: Uuid) -> CalculationRecord {
    let mut record = CalculationRecord::new(
        plot_id,
        chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        "ndvi_foody2003".to_string(),
        0.47,
    );
    record.remote_job_id = Some("job-1".to_string());
    record
        .transition_to(CalculationState::AwaitingInput)
        .unwrap();
    canopy_sat::db::calculations::save(&state.db, &record)
        .await
        .unwrap();
    record
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_module() {
    let (app, _state, _plot_id, _dir) = create_test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "canopy-sat");
}

#[tokio::test]
async fn create_with_unknown_plot_is_not_found() {
    let (app, _state, _plot_id, _dir) = create_test_app().await;

    let payload = json!({
        "plot_id": Uuid::new_v4(),
        "period_start": "2024-01-01",
        "period_end": "2024-06-01",
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/calculations")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn create_with_invalid_carbon_factor_is_bad_request() {
    let (app, _state, plot_id, _dir) = create_test_app().await;

    let payload = json!({
        "plot_id": plot_id,
        "period_start": "2024-01-01",
        "period_end": "2024-06-01",
        "carbon_factor": 1.5,
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/calculations")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_without_provider_returns_visible_error_record() {
    let (app, _state, plot_id, _dir) = create_test_app().await;

    let payload = json!({
        "plot_id": plot_id,
        "period_start": "2024-01-01",
        "period_end": "2024-06-01",
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/calculations")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    // The record is created and returned; the failure is on the record
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["state"], "error");
    assert!(json["error_message"]
        .as_str()
        .unwrap()
        .contains("credentials"));
    assert!(json["biomass_tonnes"].is_null());
}

#[tokio::test]
async fn manual_submission_flow_completes_record() {
    let (app, state, plot_id, _dir) = create_test_app().await;
    let record = seed_awaiting_record(&state, plot_id).await;

    // Submit the downloaded result file
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/calculations/{}/result-file", record.id))
                .body(Body::from(RESULT_CSV))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["state"], "completed");
    assert!(json["biomass_tonnes"].as_f64().unwrap() > 0.0);
    assert_eq!(json["observation_count"], 3);

    // Status now reports completion
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/calculations/{}/status", record.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["state"], "completed");
    assert_eq!(json["progress_pct"], 100);

    // Series is retrievable with aggregates
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/calculations/{}/series", record.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["points"].as_array().unwrap().len(), 3);
    assert_eq!(json["aggregates"]["observation_count"], 3);
    assert!(json["aggregates"]["quality_label"].is_string());
    assert!(json["aggregates"]["interpretation"].is_string());
}

#[tokio::test]
async fn invalid_submission_is_bad_request_with_cause() {
    let (app, state, plot_id, _dir) = create_test_app().await;
    let record = seed_awaiting_record(&state, plot_id).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/calculations/{}/result-file", record.id))
                .body(Body::from("timestamp,value\n2024-01-01,0.5\n"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "BAD_REQUEST");
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("unrecognized"));
}

#[tokio::test]
async fn series_on_record_without_data_is_not_found() {
    let (app, state, plot_id, _dir) = create_test_app().await;
    let record = seed_awaiting_record(&state, plot_id).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/calculations/{}/series", record.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_for_plot_returns_records() {
    let (app, state, plot_id, _dir) = create_test_app().await;
    seed_awaiting_record(&state, plot_id).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/plots/{}/calculations", plot_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn delete_removes_the_record() {
    let (app, state, plot_id, _dir) = create_test_app().await;
    let record = seed_awaiting_record(&state, plot_id).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/calculations/{}", record.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/calculations/{}", record.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_without_active_run_conflicts() {
    let (app, state, plot_id, _dir) = create_test_app().await;
    let record = seed_awaiting_record(&state, plot_id).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/calculations/{}/cancel", record.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}
