//! Engine settings and production safety policy.
//!
//! Defaults are persisted to a per-user config file. Environment variables
//! override any stored values to allow managed deployments to enforce policy.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub prod_require_confirmation: bool,
    pub prod_block_dangerous_sql: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            prod_require_confirmation: true,
            prod_block_dangerous_sql: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub connect_timeout_ms: u64,
    pub test_timeout_ms: u64,
    /// Rows per chunk for cursors opened without an explicit size
    pub default_chunk_size: usize,
    pub credential_refresh_secs: i64,
    pub query_history_limit: usize,
    /// Upper bound for one request through the engine host
    pub request_timeout_ms: u64,
    pub safety: SafetyPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            test_timeout_ms: 10_000,
            default_chunk_size: 500,
            credential_refresh_secs: 300,
            query_history_limit: 1_000,
            request_timeout_ms: 60_000,
            safety: SafetyPolicy::default(),
        }
    }
}

fn env_bool_opt(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_parse_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

/// Per-user directory holding config, logs and known_hosts.
pub fn data_dir() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .unwrap_or_else(|| std::env::var_os("USERPROFILE").unwrap_or_default());
        let mut path = PathBuf::from(appdata);
        path.push("unidb");
        path
    } else {
        let home = std::env::var_os("HOME").unwrap_or_default();
        let mut path = PathBuf::from(home);
        path.push(".unidb");
        path
    }
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

impl EngineSettings {
    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_parse_opt("UNIDB_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = env_parse_opt("UNIDB_TEST_TIMEOUT_MS") {
            self.test_timeout_ms = value;
        }
        if let Some(value) = env_parse_opt::<usize>("UNIDB_DEFAULT_CHUNK_SIZE") {
            self.default_chunk_size = value.max(1);
        }
        if let Some(value) = env_parse_opt("UNIDB_CREDENTIAL_REFRESH_SECS") {
            self.credential_refresh_secs = value;
        }
        if let Some(value) = env_parse_opt("UNIDB_QUERY_HISTORY_LIMIT") {
            self.query_history_limit = value;
        }
        if let Some(value) = env_parse_opt("UNIDB_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = value;
        }
        if let Some(value) = env_bool_opt("UNIDB_PROD_REQUIRE_CONFIRMATION") {
            self.safety.prod_require_confirmation = value;
        }
        if let Some(value) = env_bool_opt("UNIDB_PROD_BLOCK_DANGEROUS") {
            self.safety.prod_block_dangerous_sql = value;
        }
    }

    /// Loads the user config file, then applies environment overrides.
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let mut settings = match Self::read_file(path) {
            Ok(settings) => settings,
            Err(ConfigError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Ignoring config file: {}", e);
                Self::default()
            }
        };
        settings.apply_env_overrides();
        settings
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save_to_file(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(self)?;
        fs::write(path, payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = EngineSettings::read_file(&dir.path().join("absent.json"));
        assert!(matches!(settings, Err(ConfigError::Io(_))));
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");

        let mut settings = EngineSettings::default();
        settings.default_chunk_size = 42;
        settings.safety.prod_block_dangerous_sql = true;
        settings.save_to(&path).expect("save");

        let loaded = EngineSettings::read_file(&path).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"connect_timeout_ms": 500}"#).expect("write");

        let loaded = EngineSettings::read_file(&path).expect("load");
        assert_eq!(loaded.connect_timeout_ms, 500);
        assert_eq!(loaded.test_timeout_ms, 10_000);
        assert!(loaded.safety.prod_require_confirmation);
    }
}
