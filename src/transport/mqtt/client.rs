//! rumqttc-backed `DeviceTransport`
//!
//! One `MqttTransport` is one credential's session with the hub. A driver task
//! polls the rumqttc event loop, retries transient failures on its own and reports
//! every status change through the installed handler:
//!
//! - `DisconnectedRetrying` while it retries internally
//! - `Disconnected/RetryExpired` once the retry budget is spent
//! - `Disconnected/BadCredential` when the hub refuses the credential
//! - `Disconnected/DeviceDisabled` when the hub rejects the device identity
//! - `Disconnected/CommunicationError` on failures retrying cannot fix
//! - `Disabled/Expected` after `close()`

use super::connection::{
    configure_mqtt_options, encode_property_bag, MqttSettings, ReconnectConfig, TopicBuilder,
};
use super::health_monitor::{FailureKind, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::connection::credentials::Credential;
use crate::connection::retry::RetryPolicy;
use crate::connection::state::{ConnectionState, DisconnectReason};
use crate::connection::interruptible_sleep;
use crate::error::sanitize_error_message;
use crate::transport::{
    CommandHandler, CommandRequest, CommandResponse, ConfigPushHandler, DesiredConfig,
    DeviceTransport, InboundMessage, ReportedConfig, StatusChangeHandler, TelemetryMessage,
    TransportError, TransportFactory,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, Publish, QoS};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 32;

/// How long `close()` waits for the driver to wind down
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Session state as seen by the driver
#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Connecting,
    Up,
    Down { kind: FailureKind, error: String },
    Closed,
}

/// Hub answer to a twin GET or PATCH
#[derive(Debug)]
struct TwinReply {
    status: u16,
    payload: Vec<u8>,
}

fn read_lock<T: Clone>(lock: &RwLock<T>) -> T {
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_lock<T>(lock: &RwLock<T>, value: T) {
    match lock.write() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn with_map<K, V, R>(map: &StdMutex<HashMap<K, V>>, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
    match map.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

/// State shared between the handle and its driver task
struct Shared {
    device_path: String,
    status_handler: RwLock<Option<StatusChangeHandler>>,
    retry_policy: RwLock<Option<Arc<dyn RetryPolicy>>>,
    config_push: RwLock<Option<ConfigPushHandler>>,
    commands: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    pending_twin: StdMutex<HashMap<String, oneshot::Sender<TwinReply>>>,
    unacked: StdMutex<HashMap<String, Publish>>,
    epoch: AtomicU64,
    link: watch::Sender<LinkState>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl Shared {
    fn emit(&self, state: ConnectionState, reason: Option<DisconnectReason>) {
        if let Some(handler) = read_lock(&self.status_handler) {
            handler(state, reason);
        }
    }

    fn should_retry(&self, error: &TransportError) -> bool {
        match read_lock(&self.retry_policy) {
            Some(policy) => policy.should_retry(error),
            None => crate::connection::retry::should_retry(error),
        }
    }

    /// Forget state tied to the previous network connection
    fn reset_session(&self) {
        with_map(&self.pending_twin, HashMap::clear);
        with_map(&self.unacked, HashMap::clear);
    }
}

/// A session with the hub for one credential
pub struct MqttTransport {
    shared: Arc<Shared>,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    settings: MqttSettings,
    driver: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    inbound: Mutex<mpsc::Receiver<InboundMessage>>,
    closed: AtomicBool,
}

impl MqttTransport {
    pub fn new(credential: &Credential, settings: MqttSettings) -> Result<Self, TransportError> {
        let connection = credential
            .parse()
            .map_err(|e| TransportError::Unauthorized(e.to_string()))?;
        let options = configure_mqtt_options(&connection, &settings)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity.max(1));
        let (link, _) = watch::channel(LinkState::Connecting);

        debug!(credential = %credential, "Created MQTT transport");

        Ok(Self {
            shared: Arc::new(Shared {
                device_path: TopicBuilder::device_path(&connection),
                status_handler: RwLock::new(None),
                retry_policy: RwLock::new(None),
                config_push: RwLock::new(None),
                commands: RwLock::new(HashMap::new()),
                pending_twin: StdMutex::new(HashMap::new()),
                unacked: StdMutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                link,
                inbound: inbound_tx,
            }),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            settings,
            driver: Mutex::new(None),
            cancel: CancellationToken::new(),
            inbound: Mutex::new(inbound_rx),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match &*self.shared.link.borrow() {
            LinkState::Up => Ok(()),
            LinkState::Closed => Err(TransportError::ChannelClosed("transport closed".to_string())),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn wait_for_link(&self) -> Result<(), TransportError> {
        let mut link = self.shared.link.subscribe();
        let settled = link
            .wait_for(|state| !matches!(state, LinkState::Connecting))
            .await
            .map_err(|_| TransportError::ChannelClosed("driver stopped".to_string()))?
            .clone();

        match settled {
            LinkState::Up => Ok(()),
            LinkState::Closed => Err(TransportError::Cancelled),
            LinkState::Down { kind, error } => Err(match kind {
                FailureKind::Unauthorized => TransportError::Unauthorized(error),
                FailureKind::DeviceDisabled => TransportError::DeviceNotFound(error),
                FailureKind::Fatal => TransportError::Tls(error.into()),
                FailureKind::Transient => TransportError::Timeout(error),
            }),
            LinkState::Connecting => Err(TransportError::NotConnected),
        }
    }

    async fn twin_request(
        &self,
        topic: impl FnOnce(&str) -> String,
        payload: Vec<u8>,
    ) -> Result<TwinReply, TransportError> {
        self.ensure_connected()?;

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        with_map(&self.shared.pending_twin, |pending| {
            pending.insert(request_id.clone(), tx)
        });

        if let Err(e) = self
            .client
            .publish(topic(&request_id), QoS::AtMostOnce, false, payload)
            .await
        {
            with_map(&self.shared.pending_twin, |pending| pending.remove(&request_id));
            return Err(TransportError::ChannelClosed(e.to_string()));
        }

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::ChannelClosed(
                "connection reset before twin response".to_string(),
            )),
            Err(_) => {
                with_map(&self.shared.pending_twin, |pending| pending.remove(&request_id));
                Err(TransportError::Timeout(format!(
                    "no twin response for request {request_id}"
                )))
            }
        }
    }

    /// Poll the event loop until cancelled or the session is given up
    async fn drive(
        shared: Arc<Shared>,
        client: AsyncClient,
        mut event_loop: EventLoop,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) {
        let mut attempts = 0u32;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    if matches!(route, EventRoute::ConnectionAcknowledged { .. }) {
                        attempts = 0;
                    }
                    Self::process_route(&shared, &client, route, event).await;
                }
                Err(e) => {
                    let mut kind = HealthMonitor::classify_connection_error(&e);
                    let error = HealthMonitor::into_transport_error(e);
                    if kind == FailureKind::Transient && !shared.should_retry(&error) {
                        kind = FailureKind::Fatal;
                    }
                    let message = sanitize_error_message(&error.to_string());

                    if kind != FailureKind::Transient {
                        error!(error = %message, ?kind, "MQTT session failed");
                        Self::give_up(&shared, kind, message);
                        break;
                    }

                    match HealthMonitor::should_attempt_reconnection(
                        attempts,
                        &reconnect,
                        cancel.is_cancelled(),
                    ) {
                        ReconnectionDecision::Proceed { attempt, delay_ms } => {
                            if attempt == 1 {
                                shared.link.send_replace(LinkState::Connecting);
                                shared.emit(
                                    ConnectionState::DisconnectedRetrying,
                                    Some(DisconnectReason::CommunicationError),
                                );
                            }
                            attempts = attempt;
                            warn!(attempt, delay_ms, error = %message, "MQTT connection lost, retrying");
                            if !interruptible_sleep(&cancel, Duration::from_millis(delay_ms)).await {
                                break;
                            }
                        }
                        ReconnectionDecision::AbortShutdownRequested => break,
                        ReconnectionDecision::AbortMaxAttemptsExceeded => {
                            error!(attempts, error = %message, "MQTT retry budget exhausted");
                            Self::give_up(&shared, FailureKind::Transient, message);
                            break;
                        }
                    }
                }
            }
        }

        shared.reset_session();
        debug!("MQTT driver stopped");
    }

    fn give_up(shared: &Shared, kind: FailureKind, error: String) {
        shared.link.send_replace(LinkState::Down { kind, error });
        shared.reset_session();
        let (state, reason) = HealthMonitor::terminal_status(kind);
        shared.emit(state, reason);
    }

    async fn process_route(shared: &Arc<Shared>, client: &AsyncClient, route: EventRoute, event: rumqttc::Event) {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                let epoch = shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                shared.reset_session();
                Self::subscribe_all(shared, client).await;
                shared.link.send_replace(LinkState::Up);
                info!(epoch, session_present, "MQTT session established");
                shared.emit(ConnectionState::Connected, None);
            }
            EventRoute::TwinResponse {
                status,
                request_id,
                payload,
                ..
            } => {
                let waiter = with_map(&shared.pending_twin, |pending| pending.remove(&request_id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(TwinReply { status, payload });
                    }
                    None => debug!(request_id = %request_id, "Twin response without a waiter"),
                }
            }
            EventRoute::DesiredPatch { version, payload } => {
                Self::deliver_desired_patch(shared, version, &payload);
            }
            EventRoute::MethodRequest {
                name,
                request_id,
                payload,
            } => {
                Self::dispatch_method(shared, client, name, request_id, payload);
            }
            EventRoute::CloudToDevice {
                properties,
                payload,
                pkid,
            } => {
                let rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish)) = event else {
                    return;
                };
                Self::deliver_inbound(shared, properties, payload, pkid, publish);
            }
            EventRoute::Unrecognized { topic } => {
                debug!(topic = %topic, "Ignoring publish on unexpected topic");
            }
            EventRoute::Disconnected => info!("Hub closed the MQTT session"),
            EventRoute::Infrastructure => {}
        }
    }

    async fn subscribe_all(shared: &Shared, client: &AsyncClient) {
        let filters = [
            TopicBuilder::cloud_to_device_filter(&shared.device_path),
            TopicBuilder::twin_response_filter().to_string(),
            TopicBuilder::desired_patch_filter().to_string(),
            TopicBuilder::method_filter().to_string(),
        ];
        for filter in filters {
            // try_subscribe never waits on the event loop this task is driving
            if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                error!(filter = %filter, error = %e, "Failed to subscribe");
            }
        }
    }

    fn deliver_desired_patch(shared: &Shared, version: Option<i64>, payload: &[u8]) {
        let mut section: Value = match serde_json::from_slice(payload) {
            Ok(section) => section,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed desired patch");
                return;
            }
        };
        if let (Some(object), Some(version)) = (section.as_object_mut(), version) {
            object.entry("$version").or_insert(json!(version));
        }

        match DesiredConfig::from_section(&section) {
            Ok(desired) => match read_lock(&shared.config_push) {
                Some(handler) => handler(desired),
                None => debug!(version = desired.version, "Desired patch received without a handler"),
            },
            Err(e) => warn!(error = %e, "Ignoring desired patch"),
        }
    }

    fn dispatch_method(
        shared: &Shared,
        client: &AsyncClient,
        name: String,
        request_id: String,
        payload: Vec<u8>,
    ) {
        let handler = read_lock(&shared.commands).get(&name).cloned();
        let client = client.clone();

        tokio::spawn(async move {
            let response = match handler {
                Some(handler) => {
                    handler
                        .handle(CommandRequest {
                            name: name.clone(),
                            payload,
                        })
                        .await
                }
                None => {
                    warn!(method = %name, "No handler for direct method");
                    CommandResponse {
                        payload: json!({ "result": format!("Unknown direct method: {name}") })
                            .to_string()
                            .into_bytes(),
                        status: 501,
                    }
                }
            };

            let topic = TopicBuilder::method_response_topic(response.status, &request_id);
            match client
                .publish(topic, QoS::AtMostOnce, false, response.payload)
                .await
            {
                Ok(()) => debug!(method = %name, status = response.status, "Direct method answered"),
                Err(e) => warn!(method = %name, error = %e, "Failed to answer direct method"),
            }
        });
    }

    fn deliver_inbound(
        shared: &Shared,
        properties: Vec<(String, String)>,
        payload: Vec<u8>,
        pkid: u16,
        publish: Publish,
    ) {
        let epoch = shared.epoch.load(Ordering::Acquire);
        let lock_token = format!("{epoch}:{pkid}");
        let message_id = properties
            .iter()
            .find(|(k, _)| k == "$.mid")
            .map(|(_, v)| v.clone());

        let message = InboundMessage {
            message_id,
            payload,
            properties,
            lock_token: lock_token.clone(),
        };

        match shared.inbound.try_send(message) {
            Ok(()) => {
                with_map(&shared.unacked, |unacked| unacked.insert(lock_token, publish));
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(lock_token = %lock_token, "Inbound buffer full, leaving message for redelivery");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Inbound receiver dropped");
            }
        }
    }
}

#[async_trait]
impl DeviceTransport for MqttTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let event_loop = self
            .event_loop
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Protocol("transport already opened".to_string()))?;

        let driver = tokio::spawn(Self::drive(
            Arc::clone(&self.shared),
            self.client.clone(),
            event_loop,
            self.settings.reconnect.clone(),
            self.cancel.clone(),
        ));
        *self.driver.lock().await = Some(driver);

        match tokio::time::timeout(self.settings.open_timeout, self.wait_for_link()).await {
            Ok(result) => result,
            Err(_) => {
                // Stop retrying and let the coordinator decide what comes next
                self.cancel.cancel();
                self.shared.link.send_replace(LinkState::Down {
                    kind: FailureKind::Transient,
                    error: "open timed out".to_string(),
                });
                self.shared.emit(
                    ConnectionState::Disconnected,
                    Some(DisconnectReason::RetryExpired),
                );
                Err(TransportError::Timeout(format!(
                    "no connection acknowledgement within {}s",
                    self.settings.open_timeout.as_secs()
                )))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancel.cancel();
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Disconnect request not delivered");
        }

        if let Some(driver) = self.driver.lock().await.take() {
            match tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, driver).await {
                Ok(Ok(())) => debug!("MQTT driver shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT driver ended with error"),
                Err(_) => warn!("MQTT driver did not stop in time"),
                _ => {}
            }
        }

        self.shared.link.send_replace(LinkState::Closed);
        self.shared.reset_session();
        self.shared
            .emit(ConnectionState::Disabled, Some(DisconnectReason::Expected));
        info!("MQTT transport closed");
        Ok(())
    }

    async fn send(&self, message: TelemetryMessage) -> Result<(), TransportError> {
        self.ensure_connected()?;

        let mut bag: Vec<(&str, &str)> = vec![
            ("$.mid", message.message_id.as_str()),
            ("$.ct", message.content_type.as_str()),
            ("$.ce", message.content_encoding.as_str()),
        ];
        bag.extend(message.properties.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let topic = TopicBuilder::telemetry_topic(&self.shared.device_path, &encode_property_bag(bag));

        self.client
            .publish(topic, QoS::AtLeastOnce, false, message.payload)
            .await
            .map_err(|e| TransportError::ChannelClosed(e.to_string()))
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(TransportError::ChannelClosed("inbound channel closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let publish = with_map(&self.shared.unacked, |unacked| unacked.remove(&message.lock_token));
        let Some(publish) = publish else {
            return Err(TransportError::LockLost {
                message_id: message
                    .message_id
                    .clone()
                    .unwrap_or_else(|| message.lock_token.clone()),
            });
        };

        self.client
            .ack(&publish)
            .await
            .map_err(|e| TransportError::ChannelClosed(e.to_string()))
    }

    fn set_status_change_handler(&self, handler: StatusChangeHandler) {
        write_lock(&self.shared.status_handler, Some(handler));
    }

    fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        write_lock(&self.shared.retry_policy, Some(policy));
    }

    async fn get_desired_config(&self) -> Result<DesiredConfig, TransportError> {
        let reply = self.twin_request(TopicBuilder::twin_get_topic, Vec::new()).await?;
        check_twin_status(reply.status)?;

        let document: Value = serde_json::from_slice(&reply.payload)?;
        DesiredConfig::from_section(&document["desired"])
    }

    async fn push_reported_config(&self, document: &ReportedConfig) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(document)?;
        let reply = self
            .twin_request(TopicBuilder::reported_patch_topic, payload)
            .await?;
        check_twin_status(reply.status)
    }

    async fn set_config_push_handler(&self, handler: ConfigPushHandler) -> Result<(), TransportError> {
        write_lock(&self.shared.config_push, Some(handler));
        Ok(())
    }

    async fn set_command_handler(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), TransportError> {
        match self.shared.commands.write() {
            Ok(mut commands) => commands.insert(name.to_string(), handler),
            Err(poisoned) => poisoned.into_inner().insert(name.to_string(), handler),
        };
        Ok(())
    }
}

fn check_twin_status(status: u16) -> Result<(), TransportError> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(TransportError::Unauthorized(format!(
            "twin request rejected with status {status}"
        ))),
        404 => Err(TransportError::DeviceNotFound(format!(
            "twin request failed with status {status}"
        ))),
        _ => Err(TransportError::Protocol(format!(
            "twin request failed with status {status}"
        ))),
    }
}

/// Creates one `MqttTransport` per credential
#[derive(Debug, Clone, Default)]
pub struct MqttTransportFactory {
    settings: MqttSettings,
}

impl MqttTransportFactory {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

impl TransportFactory for MqttTransportFactory {
    type Transport = MqttTransport;

    fn create(&self, credential: &Credential) -> Result<MqttTransport, TransportError> {
        MqttTransport::new(credential, self.settings.clone())
    }
}
