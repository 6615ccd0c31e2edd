//! Connection state, credential fallback and reconnection coordination

pub mod coordinator;
pub mod credentials;
pub mod retry;
pub mod state;

pub use coordinator::{
    CoordinatorError, CoordinatorSettings, InitOutcome, ReconnectCoordinator,
    ReconnectCoordinatorBuilder, RunSummary,
};
pub use credentials::{ConnectionString, Credential, CredentialError, CredentialSet};
pub use retry::{is_network_error_chain, should_retry, RetryClassifier, RetryPolicy};
pub use state::{
    should_reinitialize, ConnectionState, ConnectionStateMachine, DisconnectReason, StatusChange,
};

use crate::transport::DeviceTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read-only view of the live connection used by the I/O loops
///
/// Readers never take the coordinator's exclusive lock.
pub trait ConnectionView: Send + Sync + 'static {
    type Transport: DeviceTransport;

    fn state(&self) -> ConnectionState;

    /// The currently published handle, if any
    fn active_handle(&self) -> Option<Arc<Self::Transport>>;
}

/// Sleep for `delay` unless cancelled first
///
/// Returns `false` when the token fired before the delay elapsed.
pub async fn interruptible_sleep(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
