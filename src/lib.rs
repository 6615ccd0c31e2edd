//! hublink - resilient IoT hub device client
//!
//! Keeps one device connected to its hub across network failures, credential
//! rejection and configuration drift.
//!
//! # Overview
//!
//! - [`connection`]: state machine, retry classification, credential fallback and
//!   the [`ReconnectCoordinator`](connection::ReconnectCoordinator)
//! - [`twin`]: desired/reported configuration convergence
//! - [`telemetry`] and [`commands`]: the two I/O loops and the direct-method handlers
//! - [`transport`]: the transport boundary and its MQTT implementation
//!
//! # Quick Start
//!
//! ```rust
//! use hublink::connection::{should_reinitialize, ConnectionState, Credential, CredentialSet};
//!
//! let mut credentials = CredentialSet::new([
//!     Credential::new("HostName=hub.example.net;DeviceId=dev-1;SharedAccessSignature=primary"),
//!     Credential::new("HostName=hub.example.net;DeviceId=dev-1;SharedAccessSignature=backup"),
//! ]);
//! assert!(should_reinitialize(ConnectionState::Disconnected, credentials.any()));
//!
//! // The hub rejected the primary; the backup becomes current
//! credentials.demote_current();
//! assert_eq!(credentials.len(), 1);
//! assert!(!format!("{:?}", credentials.current().unwrap()).contains("backup"));
//! ```

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod telemetry;
pub mod testing;
pub mod transport;
pub mod twin;

pub use config::{ConfigError, HubConfig};
pub use connection::{
    ConnectionState, CoordinatorError, DisconnectReason, ReconnectCoordinator, RunSummary,
};
pub use error::{HubError, HubResult};
pub use transport::mqtt::{MqttTransport, MqttTransportFactory};
pub use transport::{DeviceTransport, TransportError, TransportFactory};
pub use twin::TwinSyncEngine;
