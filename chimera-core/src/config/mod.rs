//! Configuration management for the Chimera client
//!
//! Defaults, TOML files and `CHIMERA_*` environment overrides, with
//! validation on every load path.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Poll cadences per data domain
    pub polling: PollingConfig,

    /// Session watchdog settings
    pub session: SessionConfig,

    /// Credential storage location
    pub storage: StorageConfig,

    /// Simulated backend behaviour
    pub backend: BackendConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Poll cadences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Workspace list
    #[serde(with = "humantime_serde")]
    pub workspaces: Duration,

    /// Details of the active workspace
    #[serde(with = "humantime_serde")]
    pub workspace_detail: Duration,

    #[serde(with = "humantime_serde")]
    pub conversations: Duration,

    /// Messages of the open conversation
    #[serde(with = "humantime_serde")]
    pub messages: Duration,

    #[serde(with = "humantime_serde")]
    pub memories: Duration,

    #[serde(with = "humantime_serde")]
    pub team: Duration,

    #[serde(with = "humantime_serde")]
    pub invitations: Duration,

    /// Upper bound on a single poll run
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

/// Session watchdog configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often the stored token is compared with the watched one
    #[serde(with = "humantime_serde")]
    pub recheck_interval: Duration,

    /// Route requested after an invalidation
    pub login_route: String,
}

/// Credential storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file shared by every client process ("tab")
    pub path: PathBuf,
}

/// Simulated backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Artificial delay added to every call
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            workspaces: Duration::from_secs(10),
            workspace_detail: Duration::from_secs(3),
            conversations: Duration::from_secs(3),
            messages: Duration::from_secs(2),
            memories: Duration::from_secs(15),
            team: Duration::from_secs(15),
            invitations: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_secs(2),
            login_route: crate::core_session::LOGIN_ROUTE.to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./chimera-session.json"),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(200),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern `CHIMERA_<SECTION>_<KEY>`, e.g.
    /// `CHIMERA_POLL_MESSAGES=500ms` or `CHIMERA_STORAGE_PATH=/tmp/s.json`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// Missing sections and keys fall back to their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CHIMERA_*` variables that are set
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let polling = &mut self.polling;
        for (var, slot) in [
            ("CHIMERA_POLL_WORKSPACES", &mut polling.workspaces),
            ("CHIMERA_POLL_WORKSPACE_DETAIL", &mut polling.workspace_detail),
            ("CHIMERA_POLL_CONVERSATIONS", &mut polling.conversations),
            ("CHIMERA_POLL_MESSAGES", &mut polling.messages),
            ("CHIMERA_POLL_MEMORIES", &mut polling.memories),
            ("CHIMERA_POLL_TEAM", &mut polling.team),
            ("CHIMERA_POLL_INVITATIONS", &mut polling.invitations),
            ("CHIMERA_POLL_FETCH_TIMEOUT", &mut polling.fetch_timeout),
            ("CHIMERA_SESSION_RECHECK_INTERVAL", &mut self.session.recheck_interval),
            ("CHIMERA_BACKEND_LATENCY", &mut self.backend.latency),
        ] {
            if let Ok(value) = env::var(var) {
                *slot = parse_duration(var, &value)?;
            }
        }

        if let Ok(path) = env::var("CHIMERA_STORAGE_PATH") {
            self.storage.path = PathBuf::from(path);
        }

        if let Ok(level) = env::var("CHIMERA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("CHIMERA_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.polling;
        for (name, value) in [
            ("polling.workspaces", p.workspaces),
            ("polling.workspace_detail", p.workspace_detail),
            ("polling.conversations", p.conversations),
            ("polling.messages", p.messages),
            ("polling.memories", p.memories),
            ("polling.team", p.team),
            ("polling.invitations", p.invitations),
            ("polling.fetch_timeout", p.fetch_timeout),
            ("session.recheck_interval", self.session.recheck_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if !self.session.login_route.starts_with('/') {
            return Err(ConfigError::ValidationFailed(format!(
                "session.login_route must be an absolute route: {}",
                self.session.login_route
            )));
        }

        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "storage.path must not be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

fn parse_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| ConfigError::InvalidValue(format!("Invalid duration in {var}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.polling.messages, Duration::from_secs(2));
        assert_eq!(config.polling.memories, Duration::from_secs(15));
        assert_eq!(config.session.recheck_interval, Duration::from_secs(2));
        assert_eq!(config.session.login_route, "/auth/login");
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = Config::default();
        config.polling.team = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("polling.team"));

        let mut config = Config::default();
        config.session.recheck_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.fetch_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relative_login_route_rejected() {
        let mut config = Config::default();
        config.session.login_route = "auth/login".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chimera.toml");

        let mut config = Config::default();
        config.polling.messages = Duration::from_millis(500);
        config.storage.path = dir.path().join("session.json");
        config.save_to_file(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("messages = \"500ms\""));

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chimera.toml");
        std::fs::write(&path, "[polling]\nmemories = \"1m\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();

        assert_eq!(loaded.polling.memories, Duration::from_secs(60));
        assert_eq!(loaded.polling.workspaces, Duration::from_secs(10));
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_invalid_file_value_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chimera.toml");
        std::fs::write(&path, "[polling]\nteam = \"0s\"\n").unwrap();

        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_duration_parse_error() {
        let err = parse_duration("CHIMERA_POLL_TEAM", "soon").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
        assert_eq!(
            parse_duration("CHIMERA_POLL_TEAM", "750ms").unwrap(),
            Duration::from_millis(750)
        );
    }
}
