//! Configuration loading and database path resolution
//!
//! TOML file discovery follows the platform conventions used by the other
//! canopy services: an explicit `CANOPY_CONFIG` override, then the user
//! config directory, then `/etc/canopy` on Linux.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Optional TOML configuration file contents.
///
/// Every field may be absent; environment variables take priority over the
/// file, and compiled defaults apply when neither is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// NASA EarthData account name used for AppEEARS authentication
    pub earthdata_username: Option<String>,
    /// NASA EarthData password used for AppEEARS authentication
    pub earthdata_password: Option<String>,
    /// Override for the AppEEARS API base URL (testing / mirrors)
    pub appeears_base_url: Option<String>,
    /// Path of the SQLite database file
    pub database_path: Option<String>,
}

impl TomlConfig {
    /// Load the TOML config file if one exists; absent file is not an error.
    pub fn load() -> Result<Self> {
        let path = match config_file_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(Self::default()),
        };

        let contents = std::fs::read_to_string(&path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

/// Configuration file path resolution:
/// 1. `CANOPY_CONFIG` environment variable (highest priority)
/// 2. `~/.config/canopy/config.toml`
/// 3. `/etc/canopy/config.toml` (Linux only)
fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CANOPY_CONFIG") {
        return Some(PathBuf::from(path));
    }

    if let Some(dir) = dirs::config_dir() {
        let user_config = dir.join("canopy").join("config.toml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/canopy/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Database path resolution:
/// 1. Command-line argument
/// 2. `CANOPY_DATABASE` environment variable
/// 3. TOML config file
/// 4. `./canopy.db` (fallback)
pub fn resolve_database_path(cli_arg: Option<&str>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var("CANOPY_DATABASE") {
        return PathBuf::from(path);
    }

    if let Some(path) = &toml_config.database_path {
        return PathBuf::from(path);
    }

    PathBuf::from("canopy.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_config_parses_all_fields() {
        let config: TomlConfig = toml::from_str(
            r#"
            earthdata_username = "forester"
            earthdata_password = "secret"
            appeears_base_url = "http://localhost:9100/api"
            database_path = "/tmp/canopy-test.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.earthdata_username.as_deref(), Some("forester"));
        assert_eq!(config.earthdata_password.as_deref(), Some("secret"));
        assert_eq!(
            config.appeears_base_url.as_deref(),
            Some("http://localhost:9100/api")
        );
        assert_eq!(config.database_path.as_deref(), Some("/tmp/canopy-test.db"));
    }

    #[test]
    fn toml_config_tolerates_empty_file() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert!(config.earthdata_username.is_none());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn database_path_prefers_cli_argument() {
        let toml_config = TomlConfig {
            database_path: Some("/from/toml.db".to_string()),
            ..Default::default()
        };
        let path = resolve_database_path(Some("/from/cli.db"), &toml_config);
        assert_eq!(path, PathBuf::from("/from/cli.db"));
    }
}
