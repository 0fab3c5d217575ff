//! Configuration management for session-pool.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file (JSON)
//! 3. Default values

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::RegistryConfig;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session pool timings.
    pub pool: PoolSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Session pool configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Seconds a session may stay unused before eviction.
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds allowed for closing one connection.
    pub close_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            close_timeout_secs: 5,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn env_secs(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name, value)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(secs) = env_secs("SESSION_POOL_IDLE_TIMEOUT")? {
            self.pool.idle_timeout_secs = secs;
        }
        if let Some(secs) = env_secs("SESSION_POOL_SWEEP_INTERVAL")? {
            self.pool.sweep_interval_secs = secs;
        }
        if let Some(secs) = env_secs("SESSION_POOL_CLOSE_TIMEOUT")? {
            self.pool.close_timeout_secs = secs;
        }

        if let Ok(level) = std::env::var("SESSION_POOL_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Convert to the timings used by [`SessionRegistry`](crate::SessionRegistry).
    pub fn to_registry_config(&self) -> Result<RegistryConfig, ConfigError> {
        let pool = &self.pool;
        for (name, value) in [
            ("idle_timeout_secs", pool.idle_timeout_secs),
            ("sweep_interval_secs", pool.sweep_interval_secs),
            ("close_timeout_secs", pool.close_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(name, value.to_string()));
            }
        }

        Ok(RegistryConfig {
            idle_timeout: Duration::from_secs(pool.idle_timeout_secs),
            sweep_interval: Duration::from_secs(pool.sweep_interval_secs),
            close_timeout: Duration::from_secs(pool.close_timeout_secs),
        })
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// A setting has an unusable value.
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for {}: '{}'", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.idle_timeout_secs, 1800);
        assert_eq!(config.pool.sweep_interval_secs, 300);
        assert_eq!(config.pool.close_timeout_secs, 5);
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "pool": {
                "idle_timeout_secs": 600,
                "sweep_interval_secs": 60
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pool.idle_timeout_secs, 600);
        assert_eq!(config.pool.sweep_interval_secs, 60);
        assert_eq!(config.pool.close_timeout_secs, 5); // Default
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_config_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"pool": {"close_timeout_secs": 2}}"#)
            .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pool.idle_timeout_secs, 1800);
        assert_eq!(config.pool.close_timeout_secs, 2);
    }

    #[test]
    fn test_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/session-pool.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_to_registry_config() {
        let registry = Config::default().to_registry_config().unwrap();
        assert_eq!(registry, RegistryConfig::default());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config::default();
        config.pool.sweep_interval_secs = 0;

        let err = config.to_registry_config().unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));
    }

    #[test]
    fn test_config_serialization() {
        let json = serde_json::to_string_pretty(&Config::default()).unwrap();
        assert!(json.contains("\"idle_timeout_secs\""));
        assert!(json.contains("\"level\""));
    }
}
