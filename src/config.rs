//! Configuration for the tracker service
//!
//! All sections have working defaults so the service can start with no config
//! file at all. Credentials are never stored in the file itself, only the
//! names of environment variables that hold them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Main tracker configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrackerConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub commands: CommandSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub service: ServiceSection,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Prefix for generated client IDs (must match [a-zA-Z0-9._-]+)
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Topic namespace devices publish under
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// How long to wait for the broker to confirm a connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

fn default_broker_url() -> String {
    "mqtt://broker.hivemq.com:1883".to_string()
}

fn default_client_id_prefix() -> String {
    "tracker-app".to_string()
}

fn default_namespace() -> String {
    "devices".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id_prefix: default_client_id_prefix(),
            namespace: default_namespace(),
            keepalive_secs: default_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
            username_env: None,
            password_env: None,
        }
    }
}

impl MqttSection {
    /// Resolve broker credentials from the environment.
    ///
    /// When `username_env` is configured the variable must exist. Without it,
    /// `MQTT_USERNAME` / `MQTT_PASSWORD` are picked up when present.
    pub fn resolve_credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        if let Some(username_env) = &self.username_env {
            let username = get_env_var_required(username_env)?;
            let password = match &self.password_env {
                Some(password_env) => get_env_var_required(password_env)?,
                None => String::new(),
            };
            return Ok(Some((username, password)));
        }

        match std::env::var("MQTT_USERNAME") {
            Ok(username) => {
                let password = std::env::var("MQTT_PASSWORD").unwrap_or_default();
                Ok(Some((username, password)))
            }
            Err(_) => Ok(None),
        }
    }
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Base delay before the first reconnection attempt, in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    /// Cap on the exponential backoff delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Attempts before the session is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Command dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSection {
    /// How long to wait for a device to confirm a command, in milliseconds
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,
}

fn default_confirm_timeout() -> u64 {
    5000
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: default_confirm_timeout(),
        }
    }
}

/// Telemetry batching settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    /// Number of distinct devices in the cache that triggers a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Periodic flush interval in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval() -> u64 {
    5
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// Presence heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    60
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
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
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TrackerConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: TrackerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.mqtt.broker_url).map_err(|_| {
            ConfigError::InvalidConfig(format!(
                "broker URL '{}' is not a valid URL",
                self.mqtt.broker_url
            ))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
            return Err(ConfigError::InvalidConfig(format!(
                "broker URL scheme '{}' is not supported (use mqtt, mqtts, tcp or ssl)",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(
                "broker URL has no host".to_string(),
            ));
        }

        validate_client_id_prefix(&self.mqtt.client_id_prefix)?;

        if self.mqtt.namespace.is_empty()
            || self.mqtt.namespace.contains(['/', '+', '#'])
        {
            return Err(ConfigError::InvalidConfig(format!(
                "namespace '{}' must be a single non-empty topic segment",
                self.mqtt.namespace
            )));
        }

        if self.reconnect.base_delay_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_secs must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.base_delay_secs > self.reconnect.max_delay_secs {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_secs must not exceed reconnect.max_delay_secs".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.commands.confirm_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "commands.confirm_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.telemetry.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.telemetry.flush_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.flush_interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a test configuration with short timeouts for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
client_id_prefix = "test-tracker"
namespace = "devices"

[reconnect]
base_delay_secs = 1
max_delay_secs = 4
max_attempts = 3

[commands]
confirm_timeout_ms = 100

[telemetry]
batch_size = 3
flush_interval_secs = 1
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Helper to get an environment variable with error propagation
fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Validate client ID prefix format
fn validate_client_id_prefix(prefix: &str) -> Result<(), ConfigError> {
    let valid_chars = prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if prefix.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidConfig(format!(
            "client ID prefix '{prefix}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
