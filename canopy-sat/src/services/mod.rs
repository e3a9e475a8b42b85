//! Service layer: remote extraction, ingestion, estimation, orchestration

pub mod appeears_client;
pub mod estimator;
pub mod ingest;
pub mod orchestrator;
pub mod quality;

pub use appeears_client::{AppEearsClient, ExtractionProvider};
