//! Connection state recording
//!
//! The state machine does not compute transitions. The transport reports them and
//! the coordinator records the latest one here, where every loop can read it
//! without touching the coordinator's exclusive lock.

use std::fmt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connection state as last reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Session open; sends and receives proceed normally
    Connected,
    /// The transport is retrying internally; the handle must be left alone
    DisconnectedRetrying,
    /// The session is gone; a new handle is needed
    Disconnected,
    /// The handle was closed explicitly
    Disabled,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::DisconnectedRetrying => "disconnected_retrying",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Disabled => "disabled",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the connection left the `Connected` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The credential was rejected and is assumed permanently invalid
    BadCredential,
    /// The device identity was disabled or removed on the hub
    DeviceDisabled,
    /// The transport exhausted its own retry budget
    RetryExpired,
    /// A non-retryable communication failure
    CommunicationError,
    /// Closed on request
    Expected,
    Unknown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::BadCredential => "bad_credential",
            DisconnectReason::DeviceDisabled => "device_disabled",
            DisconnectReason::RetryExpired => "retry_expired",
            DisconnectReason::CommunicationError => "communication_error",
            DisconnectReason::Expected => "expected",
            DisconnectReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded status: the state plus the reason that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub state: ConnectionState,
    pub reason: Option<DisconnectReason>,
}

impl StatusChange {
    pub fn new(state: ConnectionState, reason: Option<DisconnectReason>) -> Self {
        Self { state, reason }
    }

    fn reason_str(&self) -> &'static str {
        self.reason.map_or("none", |r| r.as_str())
    }
}

impl Default for StatusChange {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected, None)
    }
}

/// True when a new handle should be created: the session is gone (not merely
/// retrying) and there is still a credential to try.
pub fn should_reinitialize(state: ConnectionState, credentials_remaining: bool) -> bool {
    matches!(
        state,
        ConnectionState::Disconnected | ConnectionState::Disabled
    ) && credentials_remaining
}

/// Single-writer, many-reader holder of the current status
#[derive(Debug)]
pub struct ConnectionStateMachine {
    tx: watch::Sender<StatusChange>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusChange::default());
        Self { tx }
    }

    /// Record a reported status and return the one it replaced
    pub fn record(
        &self,
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    ) -> StatusChange {
        let next = StatusChange::new(state, reason);
        let previous = self.tx.send_replace(next);
        Self::log_transition(&previous, &next);
        previous
    }

    /// Record `state` only if the current status still equals `expected`
    ///
    /// Returns whether the status was replaced.
    pub fn record_if(
        &self,
        expected: StatusChange,
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    ) -> bool {
        let next = StatusChange::new(state, reason);
        let replaced = self.tx.send_if_modified(|current| {
            if *current == expected {
                *current = next;
                true
            } else {
                false
            }
        });
        if replaced {
            Self::log_transition(&expected, &next);
        }
        replaced
    }

    pub fn current(&self) -> ConnectionState {
        self.tx.borrow().state
    }

    pub fn snapshot(&self) -> StatusChange {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_connected()
    }

    /// Watch future transitions
    pub fn subscribe(&self) -> watch::Receiver<StatusChange> {
        self.tx.subscribe()
    }

    fn log_transition(from: &StatusChange, to: &StatusChange) {
        let (from_state, to_state, reason) = (from.state, to.state, to.reason_str());
        match to.state {
            ConnectionState::Connected => {
                info!(from = %from_state, to = %to_state, "Connection established");
            }
            ConnectionState::DisconnectedRetrying => {
                warn!(from = %from_state, to = %to_state, reason, "Connection lost, transport retrying");
            }
            ConnectionState::Disconnected if to.reason == Some(DisconnectReason::BadCredential) => {
                error!(from = %from_state, to = %to_state, reason, "Credential rejected");
            }
            ConnectionState::Disconnected => {
                warn!(from = %from_state, to = %to_state, reason, "Connection dropped");
            }
            ConnectionState::Disabled => {
                debug!(from = %from_state, to = %to_state, reason, "Connection closed");
            }
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
