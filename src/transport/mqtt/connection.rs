//! Pure connection configuration for the hub MQTT adapter
//!
//! Options, credentials and topic construction. Nothing here performs I/O.

use crate::connection::credentials::ConnectionString;
use crate::transport::TransportError;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;
use url::form_urlencoded;
use url::Url;

/// API version announced in the MQTT username
pub const API_VERSION: &str = "2021-04-12";

/// Hub message size limit
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_PLAIN_PORT: u16 = 1883;

/// Transport-internal reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Maximum total wait across all attempts; None for unlimited retries
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay before `attempt` (1-based): the pattern, then the sustained delay
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Adapter settings that do not come from the credential
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Overrides the hub host from the credential, e.g. `mqtt://localhost:1883`
    pub broker_url: Option<String>,
    pub keep_alive: Duration,
    /// Bound on `open()` waiting for the connection acknowledgement
    pub open_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Cloud-to-device messages buffered before new ones are left for redelivery
    pub inbound_capacity: usize,
    /// Bound on twin GET/PATCH round trips
    pub request_timeout: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_url: None,
            keep_alive: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            inbound_capacity: 64,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Adapter configuration errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Credential has no SharedAccessSignature")]
    MissingSignature,
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
}

impl From<MqttError> for TransportError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::MissingSignature | MqttError::InvalidCredential(_) => {
                TransportError::Unauthorized(error.to_string())
            }
            MqttError::InvalidBrokerUrl(_) => TransportError::Other(Box::new(error)),
        }
    }
}

/// Broker endpoint resolved from the credential and the optional override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

pub fn resolve_endpoint(
    connection: &ConnectionString,
    settings: &MqttSettings,
) -> Result<Endpoint, MqttError> {
    let Some(broker_url) = &settings.broker_url else {
        return Ok(Endpoint {
            host: connection.host_name.clone(),
            port: DEFAULT_TLS_PORT,
            tls: true,
        });
    };

    let url = Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.clone()))?;
    let tls = match url.scheme() {
        "mqtts" | "ssl" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.clone())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT });

    Ok(Endpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Client id: the device id, or `{device}/{module}` for a module identity
pub fn client_id(connection: &ConnectionString) -> String {
    match &connection.module_id {
        Some(module) => format!("{}/{}", connection.device_id, module),
        None => connection.device_id.clone(),
    }
}

/// Username expected by the hub: `{host}/{client_id}/?api-version=...`
pub fn username(connection: &ConnectionString) -> String {
    format!(
        "{}/{}/?api-version={API_VERSION}",
        connection.host_name,
        client_id(connection)
    )
}

/// Build MQTT options for one credential
pub fn configure_mqtt_options(
    connection: &ConnectionString,
    settings: &MqttSettings,
) -> Result<MqttOptions, MqttError> {
    let endpoint = resolve_endpoint(connection, settings)?;
    let password = connection
        .shared_access_signature
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(MqttError::MissingSignature)?;

    let mut mqtt_options = MqttOptions::new(client_id(connection), endpoint.host, endpoint.port);
    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_credentials(username(connection), password);
    mqtt_options.set_keep_alive(settings.keep_alive);
    // Cloud-to-device messages queued while offline must survive reconnects
    mqtt_options.set_clean_session(false);
    mqtt_options.set_manual_acks(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    Ok(mqtt_options)
}

/// Encode a property bag as `k1=v1&k2=v2`
///
/// System property keys such as `$.mid` are sent literally; everything else is
/// percent-encoded.
pub fn encode_property_bag<'a>(properties: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    properties
        .into_iter()
        .map(|(key, value)| {
            let key = if key.starts_with("$.") {
                key.to_string()
            } else {
                form_urlencoded::byte_serialize(key.as_bytes()).collect()
            };
            let value: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Hub topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// `devices/{id}` or `devices/{id}/modules/{module}`
    pub fn device_path(connection: &ConnectionString) -> String {
        match &connection.module_id {
            Some(module) => format!("devices/{}/modules/{}", connection.device_id, module),
            None => format!("devices/{}", connection.device_id),
        }
    }

    /// Telemetry topic with the encoded property bag appended
    pub fn telemetry_topic(device_path: &str, property_bag: &str) -> String {
        format!("{device_path}/messages/events/{property_bag}")
    }

    /// Cloud-to-device subscription filter
    pub fn cloud_to_device_filter(device_path: &str) -> String {
        format!("{device_path}/messages/devicebound/#")
    }

    pub fn twin_response_filter() -> &'static str {
        "$iothub/twin/res/#"
    }

    pub fn desired_patch_filter() -> &'static str {
        "$iothub/twin/PATCH/properties/desired/#"
    }

    pub fn method_filter() -> &'static str {
        "$iothub/methods/POST/#"
    }

    pub fn twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    pub fn reported_patch_topic(request_id: &str) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
    }

    pub fn method_response_topic(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }
}
