//! Configuration management for Deadbrick.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::admission::{FaultPolicy, FaultRules, RejectAction};
use crate::error::{DeadbrickError, Result};
use crate::http::ConnectionSettings;

/// Main configuration for the Deadbrick service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadbrickConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Body returned for every well-formed request
    #[serde(default = "default_body")]
    pub body: String,

    /// Seconds allowed for each whole request: line, headers and body
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            body: default_body(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_body() -> String {
    "Goodbye cruel world!".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Admission control configuration. Read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Seconds the service stays dark after a failure symptom
    #[serde(default = "default_recovery_window_secs")]
    pub recovery_window_secs: u64,

    /// Tokens added to the bucket per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket capacity and initial level
    #[serde(default = "default_window")]
    pub window: f64,

    /// What a rejected response does to the server
    #[serde(default)]
    pub on_reject: RejectAction,

    /// Whether repeat faults restart the recovery window
    #[serde(default)]
    pub fault_policy: FaultPolicy,

    /// Failure-symptom patterns
    #[serde(default)]
    pub rules: FaultRules,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            recovery_window_secs: default_recovery_window_secs(),
            rate: default_rate(),
            window: default_window(),
            on_reject: RejectAction::default(),
            fault_policy: FaultPolicy::default(),
            rules: FaultRules::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }
}

fn default_recovery_window_secs() -> u64 {
    15
}

fn default_rate() -> f64 {
    5000.0
}

fn default_window() -> f64 {
    5.0
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}', expected text or json", other)),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DeadbrickConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: DeadbrickConfig = serde_yaml::from_str(yaml)
            .map_err(|e| DeadbrickError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the admission layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        let admission = &self.admission;

        if !(admission.rate.is_finite() && admission.rate > 0.0) {
            return Err(DeadbrickError::Config(format!(
                "admission.rate must be a positive number, got {}",
                admission.rate
            )));
        }
        if !(admission.window.is_finite() && admission.window >= 1.0) {
            return Err(DeadbrickError::Config(format!(
                "admission.window must be at least 1, got {}",
                admission.window
            )));
        }
        if admission.recovery_window_secs == 0 {
            return Err(DeadbrickError::Config(
                "admission.recovery_window_secs must be greater than 0".to_string(),
            ));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(DeadbrickError::Config(
                "server.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if admission.rules.max_line_len == 0 {
            return Err(DeadbrickError::Config(
                "admission.rules.max_line_len must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-connection settings for the HTTP engine.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_line_len: self.admission.rules.max_line_len,
            body: self.server.body.clone(),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
        }
    }
}
