//! Configuration for the device client
//!
//! Loaded once from a TOML file. Credentials are listed in priority order and may
//! be given literally or through an environment variable so secrets can stay out
//! of the file.

use crate::connection::coordinator::CoordinatorSettings;
use crate::connection::credentials::{Credential, CredentialError};
use crate::transport::mqtt::{MqttSettings, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Locations searched when no config path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["hublink.toml", "config/hublink.toml"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    pub device: DeviceSection,
    pub connection: ConnectionSection,
    #[serde(default)]
    pub timing: TimingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Connection strings in priority order
    pub credentials: Vec<CredentialSource>,
    /// Overrides the hub endpoint, e.g. `mqtt://localhost:1883`
    pub broker_url: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Where a connection string comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CredentialSource {
    /// Simple form: `"HostName=...;DeviceId=...;SharedAccessSignature=..."`
    Literal(String),
    /// Indirect form: `{ env = "HUB_PRIMARY" }`
    Env { env: String },
}

/// Transport-internal retry of transient network failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Omit for unlimited attempts
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_pattern_ms")]
    pub backoff_pattern_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern_ms: default_backoff_pattern_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingSection {
    /// Wait before re-initializing after a disconnect
    #[serde(default = "default_interval_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub receive_timeout_ms: u64,
    /// Stop the run after this long; run until interrupted when absent
    pub run_duration_secs: Option<u64>,
    #[serde(default = "default_long_running_delay_ms")]
    pub long_running_delay_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: default_interval_ms(),
            poll_interval_ms: default_interval_ms(),
            receive_timeout_ms: default_interval_ms(),
            run_duration_secs: None,
            long_running_delay_ms: default_long_running_delay_ms(),
        }
    }
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_backoff_pattern_ms() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay_ms() -> u64 {
    250
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_long_running_delay_ms() -> u64 {
    20_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Credential {index} is invalid: {source}")]
    InvalidCredential {
        index: usize,
        #[source]
        source: CredentialError,
    },
    #[error("No config file found (looked for {0})")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HubConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Pick the explicit path, or the first default location that exists
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
            .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;

        if self.connection.credentials.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[connection] credentials must list at least one connection string".to_string(),
            ));
        }

        let intervals = [
            ("connection.keep_alive_secs", self.connection.keep_alive_secs),
            ("connection.open_timeout_secs", self.connection.open_timeout_secs),
            ("timing.reconnect_backoff_ms", self.timing.reconnect_backoff_ms),
            ("timing.poll_interval_ms", self.timing.poll_interval_ms),
            ("timing.receive_timeout_ms", self.timing.receive_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.timing.run_duration_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "timing.run_duration_secs must be greater than zero".to_string(),
            ));
        }

        self.resolve_credentials()?;
        Ok(())
    }

    /// Resolve every credential source, checking each parses as a connection string
    pub fn resolve_credentials(&self) -> Result<Vec<Credential>, ConfigError> {
        self.connection
            .credentials
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let raw = match source {
                    CredentialSource::Literal(value) => value.clone(),
                    CredentialSource::Env { env } => std::env::var(env)
                        .map_err(|_| ConfigError::EnvVarNotFound(env.clone()))?,
                };
                let credential = Credential::new(raw);
                credential
                    .parse()
                    .map_err(|source| ConfigError::InvalidCredential { index, source })?;
                Ok(credential)
            })
            .collect()
    }

    /// Copy with literal connection strings reduced to their secret-free label
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for source in &mut copy.connection.credentials {
            if let CredentialSource::Literal(value) = source {
                *value = Credential::new(value.as_str()).label();
            }
        }
        copy
    }

    /// Render the redacted configuration as TOML
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&self.redacted())?)
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let retry = &self.connection.retry;
        MqttSettings {
            broker_url: self.connection.broker_url.clone(),
            keep_alive: Duration::from_secs(self.connection.keep_alive_secs),
            open_timeout: Duration::from_secs(self.connection.open_timeout_secs),
            reconnect: ReconnectConfig {
                max_attempts: retry.max_attempts,
                backoff_pattern: retry.backoff_pattern_ms.clone(),
                sustained_delay: retry.sustained_delay_ms,
            },
            ..MqttSettings::default()
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            reconnect_backoff: Duration::from_millis(self.timing.reconnect_backoff_ms),
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            receive_timeout: Duration::from_millis(self.timing.receive_timeout_ms),
        }
    }

    pub fn run_duration(&self) -> Option<Duration> {
        self.timing.run_duration_secs.map(Duration::from_secs)
    }

    pub fn long_running_delay(&self) -> Duration {
        Duration::from_millis(self.timing.long_running_delay_ms)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"

[connection]
credentials = ["HostName=hub.example.net;DeviceId=test-device;SharedAccessSignature=SharedAccessSignature sr=a&sig=b&se=1"]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LITERAL: &str =
        "HostName=hub.example.net;DeviceId=dev-1;SharedAccessSignature=SharedAccessSignature sr=a&sig=secret&se=1";

    #[test]
    fn test_full_config() {
        let toml_content = format!(
            r#"
[device]
id = "thermostat-01"

[connection]
credentials = ["{LITERAL}"]
broker_url = "mqtt://localhost:1883"
keep_alive_secs = 30
open_timeout_secs = 10

[connection.retry]
max_attempts = 3
backoff_pattern_ms = [10, 20]
sustained_delay_ms = 40

[timing]
reconnect_backoff_ms = 1000
poll_interval_ms = 200
receive_timeout_ms = 300
run_duration_secs = 60
long_running_delay_ms = 500
"#
        );

        let config = HubConfig::from_toml(&toml_content).unwrap();
        assert_eq!(config.device.id, "thermostat-01");
        assert_eq!(config.connection.retry.max_attempts, Some(3));

        let mqtt = config.mqtt_settings();
        assert_eq!(mqtt.broker_url.as_deref(), Some("mqtt://localhost:1883"));
        assert_eq!(mqtt.keep_alive, Duration::from_secs(30));
        assert_eq!(mqtt.reconnect.backoff_pattern, vec![10, 20]);
        assert_eq!(mqtt.reconnect.sustained_delay, 40);

        let settings = config.coordinator_settings();
        assert_eq!(settings.reconnect_backoff, Duration::from_millis(1000));
        assert_eq!(settings.poll_interval, Duration::from_millis(200));
        assert_eq!(settings.receive_timeout, Duration::from_millis(300));
        assert_eq!(config.run_duration(), Some(Duration::from_secs(60)));
        assert_eq!(config.long_running_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = HubConfig::test_config();
        assert_eq!(config.connection.keep_alive_secs, 60);
        assert_eq!(config.connection.open_timeout_secs, 30);
        assert_eq!(config.connection.retry, RetrySection::default());
        assert_eq!(config.timing, TimingSection::default());
        assert_eq!(config.run_duration(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("invalid@device").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("valid-device_123.test").is_ok());
    }

    #[test]
    fn test_rejects_empty_credentials() {
        let result = HubConfig::from_toml(
            r#"
[device]
id = "dev-1"

[connection]
credentials = []
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = HubConfig::test_config();
        config.timing.poll_interval_ms = 0;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("timing.poll_interval_ms"));
    }

    #[test]
    fn test_rejects_malformed_credential() {
        let mut config = HubConfig::test_config();
        config
            .connection
            .credentials
            .push(CredentialSource::Literal("DeviceId=only".to_string()));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCredential { index: 1, .. })
        ));
    }

    #[test]
    fn test_missing_env_credential() {
        let mut config = HubConfig::test_config();
        config.connection.credentials = vec![CredentialSource::Env {
            env: "HUBLINK_TEST_UNSET_CREDENTIAL_VAR".to_string(),
        }];
        assert!(matches!(
            config.resolve_credentials(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "HUBLINK_TEST_UNSET_CREDENTIAL_VAR"
        ));
    }

    #[test]
    fn test_redacted_hides_secret() {
        let config = HubConfig::test_config();
        let rendered = config.to_redacted_toml().unwrap();
        assert!(rendered.contains("hub.example.net/test-device"));
        assert!(!rendered.contains("sig=b"));
        assert!(!rendered.contains("SharedAccessSignature"));
    }
}
