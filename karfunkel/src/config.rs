//! Server configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Durations are written as seconds and may be
//! fractional:
//!
//! ```json
//! {
//!   "port": 3141,
//!   "greet_timeout": 5,
//!   "ping_interval": 20,
//!   "log_level": "debug",
//!   "log_format": "json",
//!   "plugins": ["projects"]
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::plugins;

pub const DEFAULT_PORT: u16 = 3141;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Verbosity of the server log, overridable through `RUST_LOG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Shape of each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Timestamp, level, target and message.
    #[default]
    Full,
    /// Level and message only.
    Compact,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Grace period for a new connection to complete the handshake.
    #[serde(with = "seconds")]
    pub greet_timeout: Duration,
    /// Period of the keepalive ping sent to authenticated clients.
    #[serde(with = "seconds")]
    pub ping_interval: Duration,
    /// How often a running shutdown negotiation checks its votes.
    #[serde(with = "seconds")]
    pub shutdown_poll_interval: Duration,
    /// How often a project being opened is advanced by one step.
    #[serde(with = "seconds")]
    pub projects_poll_interval: Duration,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    /// Plugins loaded after `core`, in this order.
    pub plugins: Vec<String>,
    pub max_clients: usize,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            greet_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            shutdown_poll_interval: Duration::from_millis(500),
            projects_poll_interval: Duration::from_millis(100),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            plugins: vec![plugins::PROJECTS.to_string()],
            max_clients: 64,
            max_frame_bytes: protocol::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Config {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.greet_timeout.is_zero() {
            return Err(ConfigError::Invalid("greet_timeout must be positive".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Invalid("ping_interval must be positive".into()));
        }
        if self.shutdown_poll_interval.is_zero() || self.projects_poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll intervals must be positive".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".into()));
        }
        if self.max_frame_bytes < 64 {
            return Err(ConfigError::Invalid("max_frame_bytes is too small".into()));
        }

        let mut seen = HashSet::new();
        for name in &self.plugins {
            if !plugins::is_known(name) {
                return Err(ConfigError::Invalid(format!("unknown plugin `{name}`")));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!("plugin `{name}` listed twice")));
            }
        }
        Ok(())
    }

    /// Delay between a keepalive ping and the liveness check that follows.
    ///
    /// Slightly shorter than the ping interval so the check always happens
    /// before the next ping resets the flag.
    pub fn ping_check_delay(&self) -> Duration {
        self.ping_interval - self.ping_interval / 10
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fractional_seconds() {
        let config =
            Config::from_json(r#"{"greet_timeout": 0.25, "ping_interval": 2}"#).unwrap();

        assert_eq!(config.greet_timeout, Duration::from_millis(250));
        assert_eq!(config.ping_interval, Duration::from_secs(2));
        assert_eq!(config.ping_check_delay(), Duration::from_millis(1800));
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        assert!(Config::from_json(r#"{"ping_interval": -1}"#).is_err());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Config::from_json(r#"{"colour": "red"}"#).is_err());
    }

    #[test]
    fn test_log_settings_parse() {
        let config = Config::from_json(r#"{"log_level": "debug", "log_format": "json"}"#).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level.as_str(), "debug");
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = Config {
            ping_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            greet_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_plugin_lists() {
        let unknown = Config {
            plugins: vec!["teleporter".to_string()],
            ..Config::default()
        };
        assert!(unknown.validate().unwrap_err().to_string().contains("teleporter"));

        let twice = Config {
            plugins: vec!["projects".to_string(), "projects".to_string()],
            ..Config::default()
        };
        assert!(twice.validate().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 4000, "plugins": []}}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port, 4000);
        assert!(config.plugins.is_empty());
        assert_eq!(config.address(), "127.0.0.1:4000");
    }

    #[test]
    fn test_load_reports_path() {
        let error = Config::load(Path::new("/does/not/exist.json")).unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
        assert!(error.to_string().contains("/does/not/exist.json"));
    }
}
