//! Configuration for the device agent and the coordinator
//!
//! Configuration is read once at startup from a TOML file, then overridden by
//! the environment variables `BROKER`, `DATA_TOPIC`, `CMD_REQ_TOPIC`,
//! `CMD_RESP_TOPIC`, `REGISTER_TOPIC`, `DEVICE_ID` and `SERVER_ID`. When no
//! file is available the whole configuration can come from the environment.

use crate::protocol::{validate_device_id, TopicError, TopicLayout, DEFAULT_COMMAND};
use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const ENV_BROKER: &str = "BROKER";
pub const ENV_DATA_TOPIC: &str = "DATA_TOPIC";
pub const ENV_CMD_REQ_TOPIC: &str = "CMD_REQ_TOPIC";
pub const ENV_CMD_RESP_TOPIC: &str = "CMD_RESP_TOPIC";
pub const ENV_REGISTER_TOPIC: &str = "REGISTER_TOPIC";
pub const ENV_DEVICE_ID: &str = "DEVICE_ID";
pub const ENV_SERVER_ID: &str = "SERVER_ID";

/// Files tried, in order, when no configuration path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["iotlink.toml", "config/iotlink.toml"];

/// Top-level configuration shared by both binaries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub mqtt: MqttSection,
    pub topics: TopicLayout,
    /// Required only by the device agent
    #[serde(default)]
    pub device: Option<DeviceSection>,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval; also bounds how late a last-will is delivered
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long the broker keeps a persistent session after disconnect
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u32,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_session_expiry() -> u32 {
    3600
}

/// Device agent settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identity (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,
}

fn default_telemetry_interval() -> u64 {
    5
}

impl DeviceSection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            telemetry_interval_secs: default_telemetry_interval(),
        }
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }
}

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorSection {
    #[serde(default = "default_coordinator_id")]
    pub id: String,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,
    /// Command name sent on every dispatch tick
    #[serde(default = "default_command")]
    pub command: String,
    /// Treat a device as offline after this much silence (disabled if unset).
    /// Must exceed the devices' telemetry interval, or healthy devices expire
    /// between samples.
    pub presence_timeout_secs: Option<u64>,
}

fn default_coordinator_id() -> String {
    "iot-server".to_string()
}

fn default_dispatch_interval() -> u64 {
    10
}

fn default_command() -> String {
    DEFAULT_COMMAND.to_string()
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            id: default_coordinator_id(),
            dispatch_interval_secs: default_dispatch_interval(),
            command: default_command(),
            presence_timeout_secs: None,
        }
    }
}

impl CoordinatorSection {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn presence_timeout(&self) -> Option<Duration> {
        self.presence_timeout_secs.map(Duration::from_secs)
    }
}

/// Reconnection policy for the broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Give up after this many consecutive failed attempts (unlimited if unset)
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

fn default_backoff() -> Vec<u64> {
    vec![250, 500, 1000, 2000]
}

fn default_sustained_delay() -> u64 {
    5000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: default_backoff(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        ReconnectConfig {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid identity: {0}")]
    InvalidId(String),
    #[error("Invalid topic configuration: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Missing configuration section: [{0}]")]
    MissingSection(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load configuration from TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else from the first default file that
    /// exists, else from the environment alone
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            info!("Loading configuration from: {}", path.display());
            return Self::load_from_file(path);
        }

        for candidate in DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from) {
            if candidate.exists() {
                info!("Loading configuration from: {}", candidate.display());
                return Self::load_from_file(&candidate);
            }
        }

        info!("No configuration file found, using environment variables");
        Self::from_env()
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| ConfigError::EnvVarNotFound(name.to_string()))
        };

        let mut coordinator = CoordinatorSection::default();
        if let Some(server_id) = lookup(ENV_SERVER_ID) {
            coordinator.id = server_id;
        }

        Ok(AppConfig {
            mqtt: MqttSection {
                broker_url: required(ENV_BROKER)?,
                username_env: None,
                password_env: None,
                keep_alive_secs: default_keep_alive(),
                session_expiry_secs: default_session_expiry(),
            },
            topics: TopicLayout::new(
                required(ENV_DATA_TOPIC)?,
                required(ENV_CMD_REQ_TOPIC)?,
                required(ENV_CMD_RESP_TOPIC)?,
                required(ENV_REGISTER_TOPIC)?,
            ),
            device: lookup(ENV_DEVICE_ID).map(DeviceSection::new),
            coordinator,
            reconnect: ReconnectSection::default(),
        })
    }

    /// Override file values with any variables present in `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(broker) = lookup(ENV_BROKER) {
            self.mqtt.broker_url = broker;
        }
        if let Some(topic) = lookup(ENV_DATA_TOPIC) {
            self.topics.data = topic;
        }
        if let Some(topic) = lookup(ENV_CMD_REQ_TOPIC) {
            self.topics.command_request = topic;
        }
        if let Some(topic) = lookup(ENV_CMD_RESP_TOPIC) {
            self.topics.command_response = topic;
        }
        if let Some(topic) = lookup(ENV_REGISTER_TOPIC) {
            self.topics.register = topic;
        }
        if let Some(device_id) = lookup(ENV_DEVICE_ID) {
            match self.device.as_mut() {
                Some(device) => device.id = device_id,
                None => self.device = Some(DeviceSection::new(device_id)),
            }
        }
        if let Some(server_id) = lookup(ENV_SERVER_ID) {
            self.coordinator.id = server_id;
        }
    }

    /// Check identities, topic roots and intervals
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topics.validate()?;

        validate_device_id(&self.coordinator.id).map_err(|e| {
            ConfigError::InvalidId(format!("coordinator '{}': {e}", self.coordinator.id))
        })?;

        if let Some(device) = &self.device {
            validate_device_id(&device.id)
                .map_err(|e| ConfigError::InvalidId(format!("device '{}': {e}", device.id)))?;
            if device.telemetry_interval_secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "device.telemetry_interval_secs must be greater than 0".to_string(),
                ));
            }
        }

        if self.coordinator.dispatch_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "coordinator.dispatch_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.coordinator.command.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "coordinator.command cannot be empty".to_string(),
            ));
        }
        if self.coordinator.presence_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "coordinator.presence_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let (Some(timeout), Some(device)) = (self.coordinator.presence_timeout_secs, &self.device) {
            if timeout <= device.telemetry_interval_secs {
                return Err(ConfigError::InvalidConfig(format!(
                    "coordinator.presence_timeout_secs ({timeout}) must exceed device.telemetry_interval_secs ({})",
                    device.telemetry_interval_secs
                )));
            }
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or unset for unlimited"
                    .to_string(),
            ));
        }
        if self.reconnect.sustained_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.sustained_delay_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Device section, required by the device agent
    pub fn device(&self) -> Result<&DeviceSection, ConfigError> {
        self.device.as_ref().ok_or(ConfigError::MissingSection("device"))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[topics]
data = "iot/data"
command_request = "iot/cmd/req"
command_response = "iot/cmd/resp"
register = "iot/register"

[device]
id = "dev-1"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
