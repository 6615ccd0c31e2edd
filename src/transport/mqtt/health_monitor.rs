//! Pure failure classification and reconnection decisions for the MQTT adapter
//!
//! The driver task asks this module two questions after every event-loop error:
//! what kind of failure was it, and should the transport retry on its own. The
//! answers decide which status the coordinator hears about.

use super::connection::ReconnectConfig;
use crate::connection::state::{ConnectionState, DisconnectReason};
use crate::transport::TransportError;
use rumqttc::{ConnectReturnCode, ConnectionError};

/// Pure reconnection decision logic
pub struct HealthMonitor;

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// What an event-loop error means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blip; retry internally
    Transient,
    /// The hub refused the credential
    Unauthorized,
    /// The hub does not accept this device identity
    DeviceDisabled,
    /// Configuration or protocol failure; retrying will not help
    Fatal,
}

impl HealthMonitor {
    /// Determine if reconnection should be attempted
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    pub fn classify_connection_error(error: &ConnectionError) -> FailureKind {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::classify_refusal(*code),
            ConnectionError::Tls(_) => FailureKind::Fatal,
            ConnectionError::RequestsDone => FailureKind::Fatal,
            ConnectionError::Io(_)
            | ConnectionError::NetworkTimeout
            | ConnectionError::FlushTimeout
            | ConnectionError::MqttState(_)
            | ConnectionError::NotConnAck(_) => FailureKind::Transient,
            #[allow(unreachable_patterns)]
            _ => FailureKind::Transient,
        }
    }

    pub fn classify_refusal(code: ConnectReturnCode) -> FailureKind {
        match code {
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
                FailureKind::Unauthorized
            }
            ConnectReturnCode::BadClientId => FailureKind::DeviceDisabled,
            ConnectReturnCode::ServiceUnavailable => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    /// Status reported to the coordinator when the session is given up
    pub fn terminal_status(kind: FailureKind) -> (ConnectionState, Option<DisconnectReason>) {
        let reason = match kind {
            FailureKind::Transient => DisconnectReason::RetryExpired,
            FailureKind::Unauthorized => DisconnectReason::BadCredential,
            FailureKind::DeviceDisabled => DisconnectReason::DeviceDisabled,
            FailureKind::Fatal => DisconnectReason::CommunicationError,
        };
        (ConnectionState::Disconnected, Some(reason))
    }

    /// Convert an event-loop error into the transport boundary's error type
    pub fn into_transport_error(error: ConnectionError) -> TransportError {
        match error {
            ConnectionError::Io(e) => TransportError::Io(e),
            ConnectionError::Tls(e) => TransportError::Tls(e.to_string().into()),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
                TransportError::Timeout(error.to_string())
            }
            ConnectionError::ConnectionRefused(code) => match Self::classify_refusal(code) {
                FailureKind::Unauthorized => {
                    TransportError::Unauthorized(format!("connection refused: {code:?}"))
                }
                FailureKind::DeviceDisabled => {
                    TransportError::DeviceNotFound(format!("connection refused: {code:?}"))
                }
                _ => TransportError::Protocol(format!("connection refused: {code:?}")),
            },
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig {
            max_attempts: None,
            ..ReconnectConfig::default()
        };

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);

        let decision = HealthMonitor::should_attempt_reconnection(5, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 6,
                delay_ms: 250
            }
        );

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..ReconnectConfig::default()
        };
        let decision = HealthMonitor::should_attempt_reconnection(5, &limited, false);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);
    }

    #[test]
    fn test_classify_refusals() {
        assert_eq!(
            HealthMonitor::classify_refusal(ConnectReturnCode::NotAuthorized),
            FailureKind::Unauthorized
        );
        assert_eq!(
            HealthMonitor::classify_refusal(ConnectReturnCode::BadUserNamePassword),
            FailureKind::Unauthorized
        );
        assert_eq!(
            HealthMonitor::classify_refusal(ConnectReturnCode::BadClientId),
            FailureKind::DeviceDisabled
        );
        assert_eq!(
            HealthMonitor::classify_refusal(ConnectReturnCode::ServiceUnavailable),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_classify_network_errors() {
        let io = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(
            HealthMonitor::classify_connection_error(&io),
            FailureKind::Transient
        );
        assert_eq!(
            HealthMonitor::classify_connection_error(&ConnectionError::NetworkTimeout),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_terminal_status() {
        assert_eq!(
            HealthMonitor::terminal_status(FailureKind::Unauthorized),
            (
                ConnectionState::Disconnected,
                Some(DisconnectReason::BadCredential)
            )
        );
        assert_eq!(
            HealthMonitor::terminal_status(FailureKind::Transient).1,
            Some(DisconnectReason::RetryExpired)
        );
        assert_eq!(
            HealthMonitor::terminal_status(FailureKind::Fatal).1,
            Some(DisconnectReason::CommunicationError)
        );
    }

    #[test]
    fn test_into_transport_error() {
        let error = HealthMonitor::into_transport_error(ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized,
        ));
        assert!(error.is_unauthorized());

        let error = HealthMonitor::into_transport_error(ConnectionError::NetworkTimeout);
        assert!(matches!(error, TransportError::Timeout(_)));
    }
}
