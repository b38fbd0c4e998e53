//! Managed client configuration
//!
//! [`ManagedClientOptions`] is what a managed client is started with. It is
//! plain serde data, usually loaded from a TOML file:
//!
//! ```toml
//! [connection]
//! broker_url = "mqtt://localhost:1883"
//! client_id = "rx-client"
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//!
//! [queue]
//! max_pending_messages = 1000
//! ```
//!
//! Credentials are never stored in the file; only the names of the
//! environment variables holding them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Options for starting a managed client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedClientOptions {
    pub connection: ConnectionSection,
    #[serde(default)]
    pub queue: QueueSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// MQTT broker URL with protocol and port (`mqtt://` or `mqtts://`)
    pub broker_url: String,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Delay before polling again after a connection error (default: 5000)
    #[serde(default = "default_auto_reconnect_delay_ms")]
    pub auto_reconnect_delay_ms: u64,
    /// Start without a persisted broker session (default: true)
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
}

/// Outgoing message queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    /// Messages accepted before new ones are skipped
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
    /// Capacity of the request channel between client and event loop
    #[serde(default = "default_request_channel_capacity")]
    pub request_channel_capacity: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_pending_messages: default_max_pending_messages(),
            request_channel_capacity: default_request_channel_capacity(),
        }
    }
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_auto_reconnect_delay_ms() -> u64 {
    5000
}

fn default_clean_start() -> bool {
    true
}

fn default_max_pending_messages() -> usize {
    1000
}

fn default_request_channel_capacity() -> usize {
    10
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

impl ManagedClientOptions {
    /// Options with default timings for the given broker and client id
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            connection: ConnectionSection {
                broker_url: broker_url.into(),
                client_id: client_id.into(),
                username_env: None,
                password_env: None,
                keep_alive_secs: default_keep_alive_secs(),
                auto_reconnect_delay_ms: default_auto_reconnect_delay_ms(),
                clean_start: default_clean_start(),
            },
            queue: QueueSection::default(),
        }
    }

    /// Load options from a TOML file and validate them
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse options from TOML text and validate them
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: ManagedClientOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate option consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.connection.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "broker_url '{}' is not a valid URL: {e}",
                self.connection.broker_url
            ))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts") {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_url scheme must be mqtt or mqtts, got '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_url '{}' has no host",
                self.connection.broker_url
            )));
        }
        if self.connection.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client_id cannot be empty".to_string(),
            ));
        }
        if self.connection.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least 5, got {}",
                self.connection.keep_alive_secs
            )));
        }
        if self.queue.max_pending_messages == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_pending_messages must be greater than 0".to_string(),
            ));
        }
        if self.queue.request_channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "request_channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.connection.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.connection.password_env.as_ref())
    }

    /// Get MQTT username, failing if the configured variable is unset
    pub fn require_mqtt_username(&self) -> Result<Option<String>, ConfigError> {
        match &self.connection.username_env {
            None => Ok(None),
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[connection]
broker_url = "mqtts://broker.example.com:8883"
client_id = "sensor-gateway"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30
auto_reconnect_delay_ms = 1000
clean_start = false

[queue]
max_pending_messages = 50
request_channel_capacity = 20
"#;

        let options = ManagedClientOptions::from_toml_str(toml_content).unwrap();
        assert_eq!(options.connection.broker_url, "mqtts://broker.example.com:8883");
        assert_eq!(options.connection.client_id, "sensor-gateway");
        assert_eq!(options.connection.keep_alive_secs, 30);
        assert_eq!(options.connection.auto_reconnect_delay_ms, 1000);
        assert!(!options.connection.clean_start);
        assert_eq!(options.queue.max_pending_messages, 50);
        assert_eq!(options.queue.request_channel_capacity, 20);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[connection]
broker_url = "mqtt://localhost:1883"
client_id = "minimal"
"#;

        let options = ManagedClientOptions::from_toml_str(toml_content).unwrap();
        assert_eq!(options.connection.keep_alive_secs, 60);
        assert_eq!(options.connection.auto_reconnect_delay_ms, 5000);
        assert!(options.connection.clean_start);
        assert_eq!(options.connection.username_env, None);
        assert_eq!(options.queue, QueueSection::default());
    }

    #[test]
    fn test_new_matches_defaults() {
        let options = ManagedClientOptions::new("mqtt://localhost:1883", "minimal");
        let parsed = ManagedClientOptions::from_toml_str(
            r#"
[connection]
broker_url = "mqtt://localhost:1883"
client_id = "minimal"
"#,
        )
        .unwrap();
        assert_eq!(options, parsed);
    }

    #[test]
    fn test_rejects_non_mqtt_scheme() {
        let options = ManagedClientOptions::new("http://localhost:1883", "c");
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_url() {
        let options = ManagedClientOptions::new("not a url", "c");
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_empty_client_id() {
        let options = ManagedClientOptions::new("mqtt://localhost:1883", "  ");
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_queue() {
        let mut options = ManagedClientOptions::new("mqtt://localhost:1883", "c");
        options.queue.max_pending_messages = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rejects_short_keep_alive() {
        let mut options = ManagedClientOptions::new("mqtt://localhost:1883", "c");
        options.connection.keep_alive_secs = 1;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_missing_connection_section() {
        let result = ManagedClientOptions::from_toml_str("[queue]\nmax_pending_messages = 5\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_require_username_reports_missing_variable() {
        let mut options = ManagedClientOptions::new("mqtt://localhost:1883", "c");
        assert!(matches!(options.require_mqtt_username(), Ok(None)));

        options.connection.username_env = Some("RXMQTT_TEST_SURELY_UNSET_VARIABLE".to_string());
        assert!(matches!(
            options.require_mqtt_username(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
        assert_eq!(options.get_mqtt_username(), None);
    }
}
