//! Configuration resolution for canopy-sat
//!
//! EarthData credentials resolve through three tiers with
//! Database → ENV → TOML priority; polling parameters come from the
//! settings table with compiled defaults.

use canopy_common::config::TomlConfig;
use canopy_common::db::init::get_setting_or;
use canopy_common::Result;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

use crate::services::appeears_client::DEFAULT_BASE_URL;

/// EarthData account used for AppEEARS authentication
#[derive(Debug, Clone)]
pub struct EarthdataCredentials {
    pub username: String,
    pub password: String,
}

/// Resolved runtime configuration for the satellite service
#[derive(Debug, Clone)]
pub struct SatConfig {
    /// AppEEARS API base URL
    pub base_url: String,
    /// Credentials; `None` leaves remote-job endpoints unavailable
    pub credentials: Option<EarthdataCredentials>,
    /// Per-request network timeout
    pub request_timeout: Duration,
    /// Remote job polling budget
    pub poll_max_attempts: u32,
    /// Sleep between poll attempts
    pub poll_interval: Duration,
}

impl SatConfig {
    /// Resolve the full service configuration.
    pub async fn resolve(db: &SqlitePool, toml_config: &TomlConfig) -> Result<Self> {
        let username = resolve_secret(
            db,
            "earthdata_username",
            "CANOPY_EARTHDATA_USERNAME",
            toml_config.earthdata_username.as_deref(),
        )
        .await?;
        let password = resolve_secret(
            db,
            "earthdata_password",
            "CANOPY_EARTHDATA_PASSWORD",
            toml_config.earthdata_password.as_deref(),
        )
        .await?;

        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(EarthdataCredentials { username, password }),
            (None, None) => {
                warn!("EarthData credentials not configured; remote extraction is unavailable");
                None
            }
            _ => {
                warn!("EarthData credentials incomplete (need both username and password); remote extraction is unavailable");
                None
            }
        };

        let base_url = std::env::var("CANOPY_APPEEARS_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| toml_config.appeears_base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let request_timeout_ms: u64 = get_setting_or(db, "sat_request_timeout_ms", "30000")
            .await?
            .parse()
            .unwrap_or(30000);
        let poll_max_attempts: u32 = get_setting_or(db, "sat_poll_max_attempts", "60")
            .await?
            .parse()
            .unwrap_or(60);
        let poll_interval_secs: u64 = get_setting_or(db, "sat_poll_interval_secs", "30")
            .await?
            .parse()
            .unwrap_or(30);

        Ok(Self {
            base_url,
            credentials,
            request_timeout: Duration::from_millis(request_timeout_ms),
            poll_max_attempts,
            poll_interval: Duration::from_secs(poll_interval_secs),
        })
    }
}

/// Resolve one secret from Database → ENV → TOML.
///
/// Blank values count as absent. When more than one source holds a value
/// the highest-priority one wins with a warning, mirroring the behavior of
/// the other canopy services.
async fn resolve_secret(
    db: &SqlitePool,
    settings_key: &str,
    env_var: &str,
    toml_value: Option<&str>,
) -> Result<Option<String>> {
    let db_value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(settings_key)
        .fetch_optional(db)
        .await?
        .flatten();
    let db_value = db_value.filter(|v| is_valid_value(v));

    let env_value = std::env::var(env_var).ok().filter(|v| is_valid_value(v));
    let toml_value = toml_value
        .filter(|v| is_valid_value(v))
        .map(|v| v.to_string());

    let mut sources = Vec::new();
    if db_value.is_some() {
        sources.push("database");
    }
    if env_value.is_some() {
        sources.push("environment");
    }
    if toml_value.is_some() {
        sources.push("TOML");
    }

    if sources.len() > 1 {
        warn!(
            "{} found in multiple sources: {}. Using {} (highest priority).",
            settings_key,
            sources.join(", "),
            sources[0]
        );
    }

    if let Some(source) = sources.first() {
        info!("{} loaded from {}", settings_key, source);
    }

    Ok(db_value.or(env_value).or(toml_value))
}

/// A configuration value is usable when it is non-empty after trimming.
fn is_valid_value(value: &str) -> bool {
    !value.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_are_invalid() {
        assert!(!is_valid_value(""));
        assert!(!is_valid_value("   "));
        assert!(is_valid_value("secret"));
    }
}
