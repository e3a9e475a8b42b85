//! Shared types and infrastructure for the canopy services
//!
//! Provides the common error type, configuration loading, and database
//! initialization used by the service crates.

pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};
