//! Configuration loading and validation tests
//!
//! Tests focus on observable behaviour of loading, validation and error handling.

use hublink::config::{ConfigError, CredentialSource, HubConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const PRIMARY: &str =
    "HostName=hub.example.net;DeviceId=thermostat-01;SharedAccessSignature=SharedAccessSignature sr=hub&sig=primarysecret&se=1";

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(&format!(
        r#"
[device]
id = "thermostat-01"

[connection]
credentials = ["{PRIMARY}"]
broker_url = "mqtt://localhost:1883"

[timing]
poll_interval_ms = 250
run_duration_secs = 30
"#
    ));

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.id, "thermostat-01");
    assert_eq!(config.connection.credentials.len(), 1);
    assert_eq!(config.coordinator_settings().poll_interval, Duration::from_millis(250));
    assert_eq!(
        config.coordinator_settings().reconnect_backoff,
        Duration::from_secs(5)
    );
    assert_eq!(config.run_duration(), Some(Duration::from_secs(30)));
    assert_eq!(
        config.mqtt_settings().broker_url.as_deref(),
        Some("mqtt://localhost:1883")
    );

    let credentials = config.resolve_credentials().unwrap();
    assert_eq!(credentials[0].expose(), PRIMARY);
}

#[test]
fn test_env_credentials_resolve_in_order() {
    let var = "HUBLINK_TEST_BACKUP_CREDENTIAL";
    std::env::set_var(
        var,
        "HostName=hub.example.net;DeviceId=thermostat-01;SharedAccessSignature=backup",
    );

    let temp_file = write_config(&format!(
        r#"
[device]
id = "thermostat-01"

[connection]
credentials = ["{PRIMARY}", {{ env = "{var}" }}]
"#
    ));

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(
        config.connection.credentials[1],
        CredentialSource::Env {
            env: var.to_string()
        }
    );

    let credentials = config.resolve_credentials().unwrap();
    assert_eq!(credentials.len(), 2);
    assert!(credentials[1].expose().ends_with("SharedAccessSignature=backup"));
}

#[test]
fn test_missing_env_credential_fails_validation() {
    let temp_file = write_config(
        r#"
[device]
id = "thermostat-01"

[connection]
credentials = [{ env = "HUBLINK_TEST_DEFINITELY_UNSET" }]
"#,
    );

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "HUBLINK_TEST_DEFINITELY_UNSET"));
}

#[test]
fn test_invalid_device_id_rejected() {
    let temp_file = write_config(&format!(
        r#"
[device]
id = "thermostat 01!"

[connection]
credentials = ["{PRIMARY}"]
"#
    ));

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
}

#[test]
fn test_empty_credentials_rejected() {
    let temp_file = write_config(
        r#"
[device]
id = "thermostat-01"

[connection]
credentials = []
"#,
    );

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_missing_section_is_a_parse_error() {
    let temp_file = write_config(
        r#"
[device]
id = "thermostat-01"
"#,
    );

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = HubConfig::load_from_file(std::path::Path::new("/nonexistent/hublink.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_explicit_path_wins_when_locating() {
    let temp_file = write_config("");
    let located = HubConfig::locate(Some(temp_file.path())).unwrap();
    assert_eq!(located, temp_file.path());
}

#[test]
fn test_show_output_never_contains_secrets() {
    let temp_file = write_config(&format!(
        r#"
[device]
id = "thermostat-01"

[connection]
credentials = ["{PRIMARY}"]
"#
    ));

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();
    let rendered = config.to_redacted_toml().unwrap();

    assert!(!rendered.contains("primarysecret"));
    assert!(rendered.contains("hub.example.net/thermostat-01"));
}
