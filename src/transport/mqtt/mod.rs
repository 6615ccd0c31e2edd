//! MQTT transport for the hub's device endpoint
//!
//! Pure functions are kept apart from I/O so most of the adapter is testable
//! without a broker:
//!
//! - [`connection`] - options, endpoint resolution and topic construction
//! - [`message_handler`] - routing of incoming publishes
//! - [`health_monitor`] - failure classification and reconnection decisions
//! - [`client`] - the driver task and the [`DeviceTransport`](crate::transport::DeviceTransport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use hublink::connection::Credential;
//! use hublink::transport::mqtt::{MqttSettings, MqttTransportFactory};
//! use hublink::transport::{DeviceTransport, TransportFactory};
//!
//! # tokio_test::block_on(async {
//! let factory = MqttTransportFactory::new(MqttSettings::default());
//! let credential = Credential::new(
//!     "HostName=hub.example.net;DeviceId=dev-1;SharedAccessSignature=SharedAccessSignature sr=...",
//! );
//! let transport = factory.create(&credential)?;
//! transport.open().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttTransport, MqttTransportFactory};
pub use connection::{MqttError, MqttSettings, ReconnectConfig, TopicBuilder};
pub use health_monitor::{FailureKind, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
