//! Transport boundary for the device client
//!
//! The reconnection core never speaks a wire protocol itself. It drives a
//! [`DeviceTransport`] handle created by a [`TransportFactory`] from the current
//! credential, and learns about connection status changes through the handler
//! installed with [`DeviceTransport::set_status_change_handler`].

use crate::connection::credentials::Credential;
use crate::connection::retry::RetryPolicy;
use crate::connection::state::{ConnectionState, DisconnectReason};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Errors surfaced by a transport handle
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("TLS failure")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Connection closed: {0}")]
    ChannelClosed(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Message lock lost for message {message_id}")]
    LockLost { message_id: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Transport failure")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// Outbound device-to-cloud telemetry message
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
    pub properties: Vec<(String, String)>,
}

/// Inbound cloud-to-device message awaiting acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
    pub properties: Vec<(String, String)>,
    /// Opaque token the transport uses to match the acknowledgement
    pub lock_token: String,
}

/// Desired-configuration document and its version
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredConfig {
    pub properties: Map<String, Value>,
    pub version: i64,
}

impl DesiredConfig {
    pub fn new(properties: Map<String, Value>, version: i64) -> Self {
        Self {
            properties,
            version,
        }
    }

    /// Parse a desired section such as `{"x": 10, "$version": 3}`
    pub fn from_section(section: &Value) -> Result<Self, TransportError> {
        let object = section.as_object().ok_or_else(|| {
            TransportError::Protocol("desired section is not a JSON object".to_string())
        })?;

        let version = object
            .get("$version")
            .and_then(Value::as_i64)
            .ok_or_else(|| TransportError::Protocol("desired section has no $version".to_string()))?;

        Ok(Self {
            properties: object.clone(),
            version,
        })
    }

    /// Keys that carry configuration, skipping `$`-prefixed metadata
    pub fn settings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.properties.iter().filter(|(key, _)| !key.starts_with('$'))
    }
}

/// Reported document pushed back to the hub
pub type ReportedConfig = Map<String, Value>;

/// Direct-method invocation delivered by the hub
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub name: String,
    pub payload: Vec<u8>,
}

/// Answer to a direct-method invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub payload: Vec<u8>,
    pub status: u16,
}

/// Handler for a named direct method
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: CommandRequest) -> CommandResponse;
}

/// Callback invoked by the transport on every connection status change
///
/// Called from transport-owned tasks; implementations must not block.
pub type StatusChangeHandler =
    Arc<dyn Fn(ConnectionState, Option<DisconnectReason>) + Send + Sync>;

/// Callback invoked when the hub pushes a desired-configuration patch
pub type ConfigPushHandler = Arc<dyn Fn(DesiredConfig) + Send + Sync>;

/// A live session with the hub
///
/// One handle corresponds to one credential. Handles are never reopened after
/// `close()`; the coordinator creates a fresh one instead.
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Open the session; bounded by the transport's own timeout
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the session and release network resources
    async fn close(&self) -> Result<(), TransportError>;

    /// Send one telemetry message
    async fn send(&self, message: TelemetryMessage) -> Result<(), TransportError>;

    /// Wait up to `timeout` for a cloud-to-device message; `None` when nothing arrived
    async fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError>;

    /// Complete a received message so the hub does not redeliver it
    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError>;

    fn set_status_change_handler(&self, handler: StatusChangeHandler);

    fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>);

    /// Fetch the desired-configuration document
    async fn get_desired_config(&self) -> Result<DesiredConfig, TransportError>;

    /// Push the reported document
    async fn push_reported_config(&self, document: &ReportedConfig) -> Result<(), TransportError>;

    async fn set_config_push_handler(&self, handler: ConfigPushHandler) -> Result<(), TransportError>;

    async fn set_command_handler(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), TransportError>;
}

/// Creates transport handles from credentials
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: DeviceTransport;

    fn create(&self, credential: &Credential) -> Result<Self::Transport, TransportError>;
}

/// Registry of direct-method handlers installed on every new handle
pub type CommandRegistry = HashMap<String, Arc<dyn CommandHandler>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_desired_config_from_section() {
        let section = json!({"x": 10, "mode": "eco", "$version": 3});
        let desired = DesiredConfig::from_section(&section).unwrap();

        assert_eq!(desired.version, 3);
        let keys: Vec<&String> = desired.settings().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 2);
        assert!(!keys.iter().any(|k| k.starts_with('$')));
    }

    #[test]
    fn test_desired_config_requires_version() {
        let result = DesiredConfig::from_section(&json!({"x": 10}));
        assert!(matches!(result, Err(TransportError::Protocol(_))));

        let result = DesiredConfig::from_section(&json!([1, 2]));
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_transport_error_predicates() {
        assert!(TransportError::Cancelled.is_cancelled());
        assert!(TransportError::Unauthorized("expired".into()).is_unauthorized());
        assert!(!TransportError::NotConnected.is_unauthorized());
    }
}
