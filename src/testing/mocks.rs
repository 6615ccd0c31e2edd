//! Mock transport for testing
//!
//! Every handle created by a [`MockTransportFactory`] shares one [`MockScript`].
//! Tests script the hub's behaviour through it (rejected credentials, desired
//! documents, inbound messages) and inspect what the client did afterwards.

use crate::connection::credentials::Credential;
use crate::connection::retry::RetryPolicy;
use crate::connection::state::{ConnectionState, DisconnectReason};
use crate::transport::{
    CommandHandler, ConfigPushHandler, DesiredConfig, DeviceTransport, InboundMessage,
    ReportedConfig, StatusChangeHandler, TelemetryMessage, TransportError, TransportFactory,
};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct ScriptState {
    desired: Option<DesiredConfig>,
    rejected: HashSet<String>,
    transient_open_failures: usize,
    malformed: HashSet<String>,
    failed_creates: usize,
    open_delay: Duration,
    fail_reported_push: bool,
    lock_lost: HashSet<String>,
    inbound: VecDeque<InboundMessage>,

    handles: Vec<Arc<MockHandle>>,
    live: usize,
    max_live: usize,
    double_closes: usize,
    sent: Vec<TelemetryMessage>,
    reported: Vec<ReportedConfig>,
    acked: Vec<String>,
    desired_fetches: usize,
}

/// Scripted hub shared by all mock handles
#[derive(Default)]
pub struct MockScript {
    state: Mutex<ScriptState>,
}

impl MockScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Desired document returned by `get_desired_config`
    pub fn set_desired(&self, desired: DesiredConfig) {
        lock(&self.state).desired = Some(desired);
    }

    /// Opening a handle with this credential reports `BadCredential` and fails
    pub fn reject_credential(&self, credential: &Credential) {
        lock(&self.state)
            .rejected
            .insert(credential.expose().to_string());
    }

    /// The next `count` opens report `RetryExpired` and fail with a timeout
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).transient_open_failures = count;
    }

    /// Creating a handle with this credential fails with `Unauthorized`
    pub fn reject_at_create(&self, credential: &Credential) {
        lock(&self.state)
            .malformed
            .insert(credential.expose().to_string());
    }

    /// The next `count` handle creations fail with an I/O error
    pub fn fail_next_creates(&self, count: usize) {
        lock(&self.state).failed_creates = count;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        lock(&self.state).open_delay = delay;
    }

    pub fn fail_reported_push(&self, fail: bool) {
        lock(&self.state).fail_reported_push = fail;
    }

    /// Acknowledging this message id yields `LockLost`
    pub fn mark_lock_lost(&self, message_id: &str) {
        lock(&self.state).lock_lost.insert(message_id.to_string());
    }

    pub fn queue_inbound(&self, message: InboundMessage) {
        lock(&self.state).inbound.push_back(message);
    }

    /// Credentials of every handle created so far, oldest first
    pub fn created_credentials(&self) -> Vec<Credential> {
        lock(&self.state)
            .handles
            .iter()
            .map(|h| h.credential.clone())
            .collect()
    }

    pub fn handle_count(&self) -> usize {
        lock(&self.state).handles.len()
    }

    /// Handles opened and not yet closed
    pub fn live_handles(&self) -> usize {
        lock(&self.state).live
    }

    pub fn max_live_handles(&self) -> usize {
        lock(&self.state).max_live
    }

    pub fn double_closes(&self) -> usize {
        lock(&self.state).double_closes
    }

    pub fn closed_handles(&self) -> usize {
        lock(&self.state)
            .handles
            .iter()
            .filter(|h| h.closed.load(Ordering::Acquire))
            .count()
    }

    pub fn sent(&self) -> Vec<TelemetryMessage> {
        lock(&self.state).sent.clone()
    }

    pub fn reported(&self) -> Vec<ReportedConfig> {
        lock(&self.state).reported.clone()
    }

    pub fn acked(&self) -> Vec<String> {
        lock(&self.state).acked.clone()
    }

    pub fn desired_fetches(&self) -> usize {
        lock(&self.state).desired_fetches
    }

    /// Command names installed on the newest handle
    pub fn installed_commands(&self) -> Vec<String> {
        let Some(handle) = self.latest() else {
            return Vec::new();
        };
        let mut names: Vec<String> = lock(&handle.commands).clone();
        names.sort();
        names
    }

    /// Whether the newest handle had a retry policy installed
    pub fn retry_policy_installed(&self) -> bool {
        self.latest()
            .map(|h| lock(&h.retry_policy).is_some())
            .unwrap_or(false)
    }

    /// Report a status change from the newest handle
    pub fn emit_status(&self, state: ConnectionState, reason: Option<DisconnectReason>) -> bool {
        match self.latest() {
            Some(handle) => {
                handle.emit(state, reason);
                true
            }
            None => false,
        }
    }

    /// Report a status change from the handle created `index`-th (0-based)
    pub fn emit_status_from(
        &self,
        index: usize,
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    ) -> bool {
        let handle = lock(&self.state).handles.get(index).cloned();
        match handle {
            Some(handle) => {
                handle.emit(state, reason);
                true
            }
            None => false,
        }
    }

    /// Push a desired patch through the newest handle's config-push handler
    pub fn push_desired(&self, desired: DesiredConfig) -> bool {
        let handler = self.latest().and_then(|h| lock(&h.config_push).clone());
        match handler {
            Some(handler) => {
                handler(desired);
                true
            }
            None => false,
        }
    }

    fn latest(&self) -> Option<Arc<MockHandle>> {
        lock(&self.state).handles.last().cloned()
    }
}

struct MockHandle {
    credential: Credential,
    status_handler: Mutex<Option<StatusChangeHandler>>,
    retry_policy: Mutex<Option<Arc<dyn RetryPolicy>>>,
    config_push: Mutex<Option<ConfigPushHandler>>,
    commands: Mutex<Vec<String>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl MockHandle {
    fn emit(&self, state: ConnectionState, reason: Option<DisconnectReason>) {
        let handler = lock(&self.status_handler).clone();
        if let Some(handler) = handler {
            handler(state, reason);
        }
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }
}

/// Mock transport handle
pub struct MockTransport {
    handle: Arc<MockHandle>,
    script: Arc<MockScript>,
}

impl MockTransport {
    pub fn credential(&self) -> &Credential {
        &self.handle.credential
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.handle.is_open() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let (delay, rejected, transient) = {
            let mut state = lock(&self.script.state);
            let transient = state.transient_open_failures > 0;
            if transient {
                state.transient_open_failures -= 1;
            }
            (
                state.open_delay,
                state.rejected.contains(self.handle.credential.expose()),
                transient,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if rejected {
            self.handle.emit(
                ConnectionState::Disconnected,
                Some(DisconnectReason::BadCredential),
            );
            return Err(TransportError::Unauthorized(format!(
                "hub rejected {}",
                self.handle.credential
            )));
        }
        if transient {
            self.handle.emit(
                ConnectionState::Disconnected,
                Some(DisconnectReason::RetryExpired),
            );
            return Err(TransportError::Timeout("mock open timed out".to_string()));
        }

        if !self.handle.opened.swap(true, Ordering::AcqRel) {
            let mut state = lock(&self.script.state);
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.handle.closed.swap(true, Ordering::AcqRel) {
            lock(&self.script.state).double_closes += 1;
            return Ok(());
        }
        if self.handle.opened.load(Ordering::Acquire) {
            lock(&self.script.state).live -= 1;
        }
        self.handle
            .emit(ConnectionState::Disabled, Some(DisconnectReason::Expected));
        Ok(())
    }

    async fn send(&self, message: TelemetryMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.script.state).sent.push(message);
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        self.ensure_open()?;
        let next = lock(&self.script.state).inbound.pop_front();
        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(next)
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.script.state);
        let id = message
            .message_id
            .clone()
            .unwrap_or_else(|| message.lock_token.clone());
        if state.lock_lost.contains(&id) {
            return Err(TransportError::LockLost { message_id: id });
        }
        state.acked.push(id);
        Ok(())
    }

    fn set_status_change_handler(&self, handler: StatusChangeHandler) {
        *lock(&self.handle.status_handler) = Some(handler);
    }

    fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        *lock(&self.handle.retry_policy) = Some(policy);
    }

    async fn get_desired_config(&self) -> Result<DesiredConfig, TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.script.state);
        state.desired_fetches += 1;
        state
            .desired
            .clone()
            .ok_or_else(|| TransportError::Protocol("no desired document scripted".to_string()))
    }

    async fn push_reported_config(&self, document: &ReportedConfig) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.script.state);
        if state.fail_reported_push {
            return Err(TransportError::Protocol(
                "reported push rejected".to_string(),
            ));
        }
        state.reported.push(document.clone());
        Ok(())
    }

    async fn set_config_push_handler(&self, handler: ConfigPushHandler) -> Result<(), TransportError> {
        *lock(&self.handle.config_push) = Some(handler);
        Ok(())
    }

    async fn set_command_handler(
        &self,
        name: &str,
        _handler: Arc<dyn CommandHandler>,
    ) -> Result<(), TransportError> {
        lock(&self.handle.commands).push(name.to_string());
        Ok(())
    }
}

/// Factory producing [`MockTransport`] handles bound to one script
#[derive(Clone)]
pub struct MockTransportFactory {
    script: Arc<MockScript>,
}

impl MockTransportFactory {
    pub fn new(script: Arc<MockScript>) -> Self {
        Self { script }
    }

    pub fn script(&self) -> Arc<MockScript> {
        Arc::clone(&self.script)
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn create(&self, credential: &Credential) -> Result<MockTransport, TransportError> {
        {
            let mut state = lock(&self.script.state);
            if state.malformed.contains(credential.expose()) {
                return Err(TransportError::Unauthorized(format!(
                    "malformed credential {credential}"
                )));
            }
            if state.failed_creates > 0 {
                state.failed_creates -= 1;
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "client setup failed",
                )));
            }
        }
        let handle = Arc::new(MockHandle {
            credential: credential.clone(),
            status_handler: Mutex::new(None),
            retry_policy: Mutex::new(None),
            config_push: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        lock(&self.script.state).handles.push(Arc::clone(&handle));

        Ok(MockTransport {
            handle,
            script: Arc::clone(&self.script),
        })
    }
}

/// Connection string for a mock device; distinct `n` give distinct credentials
pub fn mock_credential(n: usize) -> Credential {
    Credential::new(format!(
        "HostName=hub-{n}.example.net;DeviceId=dev-{n};SharedAccessSignature=SharedAccessSignature sr=x&sig=secret{n}&se=1"
    ))
}

/// Cloud-to-device message with the given id
pub fn mock_inbound(message_id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        message_id: Some(message_id.to_string()),
        payload: body.as_bytes().to_vec(),
        properties: vec![("$.mid".to_string(), message_id.to_string())],
        lock_token: format!("1:{message_id}"),
    }
}
