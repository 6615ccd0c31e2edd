//! Cloud-to-device message drain
//!
//! Each connected cycle waits up to the receive timeout for one message, logs it
//! and completes it. An empty receive is the normal idle case. A lost lock means
//! the hub already handed the message to someone else; it will be redelivered,
//! so the acknowledgement is not retried.

use crate::connection::{interruptible_sleep, ConnectionView};
use crate::error::LoopError;
use crate::loop_span;
use crate::transport::{DeviceTransport, InboundMessage, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

const LOOP_NAME: &str = "commands";

/// Counters reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub received: u64,
    pub acknowledged: u64,
    pub lock_lost: u64,
}

/// Receives and acknowledges cloud-to-device messages while connected
pub struct CommandDrainLoop<V: ConnectionView> {
    view: Arc<V>,
    poll_interval: Duration,
    receive_timeout: Duration,
}

impl<V: ConnectionView> CommandDrainLoop<V> {
    pub fn new(view: Arc<V>, poll_interval: Duration, receive_timeout: Duration) -> Self {
        Self {
            view,
            poll_interval,
            receive_timeout,
        }
    }

    /// Run until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<DrainStats, LoopError> {
        let span = loop_span!(name = LOOP_NAME);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(self, cancel: CancellationToken) -> Result<DrainStats, LoopError> {
        info!(
            receive_timeout_ms = self.receive_timeout.as_millis() as u64,
            "Command drain loop started"
        );
        let mut stats = DrainStats::default();

        while !cancel.is_cancelled() {
            self.drain_one(&cancel, &mut stats).await?;
            if !interruptible_sleep(&cancel, self.poll_interval).await {
                break;
            }
        }

        info!(
            received = stats.received,
            acknowledged = stats.acknowledged,
            lock_lost = stats.lock_lost,
            "Command drain loop stopped"
        );
        Ok(stats)
    }

    async fn drain_one(
        &self,
        cancel: &CancellationToken,
        stats: &mut DrainStats,
    ) -> Result<(), LoopError> {
        let state = self.view.state();
        if !state.is_connected() {
            debug!(state = %state, "Not connected, skipping receive");
            return Ok(());
        }
        let Some(handle) = self.view.active_handle() else {
            return Ok(());
        };

        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = handle.receive(self.receive_timeout) => result,
        };

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("No cloud-to-device message within timeout");
                return Ok(());
            }
            Err(e) => return LoopError::escalate(LOOP_NAME, e),
        };

        stats.received += 1;
        log_message(&message);

        match handle.acknowledge(&message).await {
            Ok(()) => {
                stats.acknowledged += 1;
                debug!(lock_token = %message.lock_token, "Message acknowledged");
                Ok(())
            }
            Err(TransportError::LockLost { message_id }) => {
                stats.lock_lost += 1;
                warn!(
                    message_id = %message_id,
                    "Message lock lost before acknowledgement, expecting redelivery"
                );
                Ok(())
            }
            Err(e) => LoopError::escalate(LOOP_NAME, e),
        }
    }
}

fn log_message(message: &InboundMessage) {
    let properties = message
        .properties
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");

    info!(
        message_id = message.message_id.as_deref().unwrap_or("-"),
        bytes = message.payload.len(),
        body = %String::from_utf8_lossy(&message.payload),
        properties = %properties,
        "Cloud-to-device message received"
    );
}
