//! NASA AppEEARS API client
//!
//! Drives the external extraction service: bearer authentication, job
//! submission, single-shot status checks, result-bundle listing and file
//! download. Polling loops and retry policy live in the orchestrator, not
//! here; every method performs exactly one API call.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "https://appeears.earthdatacloud.nasa.gov/api";
const USER_AGENT: &str = "canopy/0.1.0 (forest biomass monitoring)";

/// Remote extraction service errors
#[derive(Debug, Error)]
pub enum RemoteServiceError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Unexpected response: {0}")]
    Parse(String),
}

/// Bearer credential obtained from the login endpoint
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
}

/// Remote job status, one observation per poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// Map the service's status strings onto the closed status set. Anything
    /// that is neither queued nor terminal counts as running.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "done" => JobStatus::Done,
            "error" => JobStatus::Error,
            "pending" | "queued" => JobStatus::Pending,
            _ => JobStatus::Running,
        }
    }
}

/// One downloadable file in a completed job's result bundle
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileDescriptor {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: Option<i64>,
}

/// Product layer requested from the extraction service
#[derive(Debug, Clone, Serialize)]
pub struct ProductLayer {
    pub product: String,
    pub layer: String,
}

/// Default extraction request: MODIS Terra 16-day vegetation indices
pub fn default_products() -> Vec<ProductLayer> {
    vec![
        ProductLayer {
            product: "MOD13Q1.061".to_string(),
            layer: "_250m_16_days_NDVI".to_string(),
        },
        ProductLayer {
            product: "MOD13Q1.061".to_string(),
            layer: "_250m_16_days_EVI".to_string(),
        },
    ]
}

/// Seam between the orchestrator and the remote service, so the poll loop
/// is testable against a scripted fake.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn create_job(
        &self,
        plot_id: Uuid,
        vertices: [[f64; 2]; 4],
        period_start: NaiveDate,
        period_end: NaiveDate,
        products: &[ProductLayer],
    ) -> Result<String, RemoteServiceError>;

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus, RemoteServiceError>;

    async fn list_result_files(
        &self,
        job_id: &str,
    ) -> Result<Vec<FileDescriptor>, RemoteServiceError>;

    async fn download_file(
        &self,
        job_id: &str,
        file_id: &str,
    ) -> Result<Vec<u8>, RemoteServiceError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct TaskCreatedResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct BundleResponse {
    #[serde(default)]
    files: Vec<FileDescriptor>,
}

/// AppEEARS API client
///
/// The credential is an explicit value held inside the client and lazily
/// (re-)acquired when a call is attempted without one; there is no
/// module-level state.
pub struct AppEearsClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    credential: Mutex<Option<Credential>>,
}

impl AppEearsClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, RemoteServiceError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            credential: Mutex::new(None),
        })
    }

    /// Exchange username/password for a bearer credential.
    ///
    /// Authentication failure is fatal and surfaced to the caller; it is
    /// never retried silently.
    pub async fn authenticate(&self) -> Result<Credential, RemoteServiceError> {
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteServiceError::Auth(format!(
                "login rejected with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;

        tracing::info!("Authenticated with AppEEARS");
        Ok(Credential { token: login.token })
    }

    /// Return the cached bearer token, authenticating first if absent.
    async fn bearer_token(&self) -> Result<String, RemoteServiceError> {
        let mut credential = self.credential.lock().await;
        if credential.is_none() {
            *credential = Some(self.authenticate().await?);
        }
        Ok(credential.as_ref().map(|c| c.token.clone()).unwrap_or_default())
    }

    /// Convert a non-success response into an API error; a 401 also drops
    /// the cached credential so the next call re-authenticates.
    async fn check_response(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RemoteServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 401 {
            self.credential.lock().await.take();
        }

        let body = response.text().await.unwrap_or_default();
        Err(RemoteServiceError::Api(status.as_u16(), body))
    }

    /// List the remote product catalog (passthrough).
    pub async fn list_products(&self) -> Result<Vec<serde_json::Value>, RemoteServiceError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/product", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;
        let response = self.check_response(response).await?;

        response
            .json()
            .await
            .map_err(|e| RemoteServiceError::Parse(e.to_string()))
    }
}

/// Centroid of the plot's four boundary vertices, as (lat, lon).
///
/// The extraction service only accepts a point sample for sub-pixel areas,
/// so small plots are sampled at their centroid.
fn centroid(vertices: &[[f64; 2]; 4]) -> (f64, f64) {
    let lat = vertices.iter().map(|v| v[0]).sum::<f64>() / vertices.len() as f64;
    let lon = vertices.iter().map(|v| v[1]).sum::<f64>() / vertices.len() as f64;
    (lat, lon)
}

/// Build the task submission payload.
///
/// Dates use the service's MM-DD-YYYY wire format; the task name embeds the
/// plot id and creation time so repeated submissions never collide.
fn build_task_payload(
    plot_id: Uuid,
    vertices: &[[f64; 2]; 4],
    period_start: NaiveDate,
    period_end: NaiveDate,
    products: &[ProductLayer],
    created_unix: i64,
) -> serde_json::Value {
    let (lat, lon) = centroid(vertices);

    json!({
        "task_type": "point",
        "task_name": format!("plot_{}_{}", plot_id.simple(), created_unix),
        "params": {
            "dates": [{
                "startDate": period_start.format("%m-%d-%Y").to_string(),
                "endDate": period_end.format("%m-%d-%Y").to_string(),
            }],
            "layers": products,
            "coordinates": [{
                "id": format!("plot_{}", plot_id.simple()),
                "latitude": lat,
                "longitude": lon,
                "category": "plot",
            }],
        },
    })
}

#[async_trait]
impl ExtractionProvider for AppEearsClient {
    async fn create_job(
        &self,
        plot_id: Uuid,
        vertices: [[f64; 2]; 4],
        period_start: NaiveDate,
        period_end: NaiveDate,
        products: &[ProductLayer],
    ) -> Result<String, RemoteServiceError> {
        let token = self.bearer_token().await?;
        let payload = build_task_payload(
            plot_id,
            &vertices,
            period_start,
            period_end,
            products,
            chrono::Utc::now().timestamp(),
        );

        let response = self
            .http
            .post(format!("{}/task", self.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;
        let response = self.check_response(response).await?;

        let created: TaskCreatedResponse = response
            .json()
            .await
            .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;

        tracing::info!(plot_id = %plot_id, task_id = %created.task_id, "Extraction job created");
        Ok(created.task_id)
    }

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus, RemoteServiceError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/task/{}", self.base_url, job_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;
        let response = self.check_response(response).await?;

        let status: TaskStatusResponse = response
            .json()
            .await
            .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;

        Ok(JobStatus::parse(&status.status))
    }

    async fn list_result_files(
        &self,
        job_id: &str,
    ) -> Result<Vec<FileDescriptor>, RemoteServiceError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/bundle/{}", self.base_url, job_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;
        let response = self.check_response(response).await?;

        let bundle: BundleResponse = response
            .json()
            .await
            .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;

        Ok(bundle.files)
    }

    async fn download_file(
        &self,
        job_id: &str,
        file_id: &str,
    ) -> Result<Vec<u8>, RemoteServiceError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/bundle/{}/{}", self.base_url, job_id, file_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;
        let response = self.check_response(response).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteServiceError::Network(e.to_string()))?;

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTICES: [[f64; 2]; 4] = [
        [-0.60, -76.10],
        [-0.60, -76.20],
        [-0.70, -76.20],
        [-0.70, -76.10],
    ];

    #[test]
    fn centroid_averages_vertices() {
        let (lat, lon) = centroid(&VERTICES);
        assert!((lat - -0.65).abs() < 1e-9);
        assert!((lon - -76.15).abs() < 1e-9);
    }

    #[test]
    fn job_status_maps_service_strings() {
        assert_eq!(JobStatus::parse("done"), JobStatus::Done);
        assert_eq!(JobStatus::parse("error"), JobStatus::Error);
        assert_eq!(JobStatus::parse("pending"), JobStatus::Pending);
        assert_eq!(JobStatus::parse("queued"), JobStatus::Pending);
        assert_eq!(JobStatus::parse("processing"), JobStatus::Running);
    }

    #[test]
    fn task_payload_uses_wire_date_format_and_unique_name() {
        let plot_id = Uuid::new_v4();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        let payload =
            build_task_payload(plot_id, &VERTICES, start, end, &default_products(), 1717200000);

        assert_eq!(payload["task_type"], "point");
        assert_eq!(
            payload["task_name"],
            format!("plot_{}_1717200000", plot_id.simple())
        );
        assert_eq!(payload["params"]["dates"][0]["startDate"], "01-01-2024");
        assert_eq!(payload["params"]["dates"][0]["endDate"], "06-01-2024");
        assert_eq!(payload["params"]["layers"][0]["layer"], "_250m_16_days_NDVI");
        assert_eq!(payload["params"]["coordinates"][0]["latitude"], -0.65);
    }
}
