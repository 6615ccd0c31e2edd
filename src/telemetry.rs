//! Device-to-cloud telemetry
//!
//! The loop sends one message per poll interval while the connection is up and
//! idles otherwise. It reads the state on every cycle and never touches the
//! coordinator's exclusive lock.

use crate::connection::{interruptible_sleep, ConnectionView};
use crate::error::LoopError;
use crate::loop_span;
use crate::transport::{DeviceTransport, TelemetryMessage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

const LOOP_NAME: &str = "telemetry";

/// Temperature above which a reading is flagged
pub const TEMPERATURE_ALERT_THRESHOLD: f64 = 30.0;

/// Produces telemetry messages on demand
pub trait TelemetrySource: Send + 'static {
    fn next_message(&mut self) -> TelemetryMessage;
}

/// One simulated sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
}

impl Reading {
    pub fn is_alert(&self) -> bool {
        self.temperature > TEMPERATURE_ALERT_THRESHOLD
    }

    /// Encode as a JSON telemetry message
    pub fn into_message(self, message_id: u64) -> TelemetryMessage {
        let alert = self.is_alert();
        TelemetryMessage {
            message_id: message_id.to_string(),
            payload: serde_json::to_vec(&self).unwrap_or_default(),
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
            properties: vec![
                ("temperatureAlert".to_string(), alert.to_string()),
                (
                    "level".to_string(),
                    if alert { "critical" } else { "normal" }.to_string(),
                ),
            ],
        }
    }
}

/// Random temperature/humidity readings with a running message id
#[derive(Debug)]
pub struct SimulatedSensor {
    rng: StdRng,
    next_id: u64,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            next_id: 0,
        }
    }

    /// Deterministic readings for tests
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            next_id: 0,
        }
    }

    pub fn read(&mut self) -> Reading {
        Reading {
            temperature: self.rng.gen_range(20.0..35.0),
            humidity: self.rng.gen_range(60.0..80.0),
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SimulatedSensor {
    fn next_message(&mut self) -> TelemetryMessage {
        let id = self.next_id;
        self.next_id += 1;
        self.read().into_message(id)
    }
}

/// Sends telemetry while connected
pub struct TelemetryLoop<V: ConnectionView> {
    view: Arc<V>,
    source: Box<dyn TelemetrySource>,
    poll_interval: Duration,
}

impl<V: ConnectionView> TelemetryLoop<V> {
    pub fn new(view: Arc<V>, source: Box<dyn TelemetrySource>, poll_interval: Duration) -> Self {
        Self {
            view,
            source,
            poll_interval,
        }
    }

    /// Run until cancelled; returns the number of messages sent
    pub async fn run(self, cancel: CancellationToken) -> Result<u64, LoopError> {
        let span = loop_span!(name = LOOP_NAME);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(mut self, cancel: CancellationToken) -> Result<u64, LoopError> {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Telemetry loop started"
        );
        let mut sent = 0u64;

        while !cancel.is_cancelled() {
            if self.send_one(&cancel).await? {
                sent += 1;
            }
            if !interruptible_sleep(&cancel, self.poll_interval).await {
                break;
            }
        }

        info!(sent, "Telemetry loop stopped");
        Ok(sent)
    }

    /// One cycle; `Ok(true)` when a message went out
    async fn send_one(&mut self, cancel: &CancellationToken) -> Result<bool, LoopError> {
        let state = self.view.state();
        if !state.is_connected() {
            debug!(state = %state, "Not connected, skipping telemetry");
            return Ok(false);
        }
        let Some(handle) = self.view.active_handle() else {
            debug!("No active handle, skipping telemetry");
            return Ok(false);
        };

        let message = self.source.next_message();
        let message_id = message.message_id.clone();

        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            result = handle.send(message) => result,
        };

        match result {
            Ok(()) => {
                debug!(message_id = %message_id, "Telemetry sent");
                Ok(true)
            }
            Err(e) => LoopError::escalate(LOOP_NAME, e).map(|()| false),
        }
    }
}
