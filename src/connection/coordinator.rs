//! Reconnection coordinator
//!
//! Owns the single live transport handle and the credential list. Status
//! notifications from the transport are tagged with the generation of the handle
//! that produced them and queued on a control channel; one processor task applies
//! them in order, so a notification never races another one and a closed handle
//! can never overwrite the state of its successor.
//!
//! Lock discipline: the credential mutex is the exclusive lock. It guards
//! credential mutation and handle create/destroy. The published handle slot is a
//! short-lived `RwLock` that is never held across an await, so the I/O loops can
//! read it without waiting on a reconnect.

use super::credentials::{Credential, CredentialSet};
use super::retry::{RetryClassifier, RetryPolicy};
use super::state::{
    should_reinitialize, ConnectionState, ConnectionStateMachine, DisconnectReason, StatusChange,
};
use super::{interruptible_sleep, ConnectionView};
use crate::commands::{CommandDrainLoop, DrainStats};
use crate::connection_span;
use crate::error::{sanitize_error_message, LoopError};
use crate::telemetry::{SimulatedSensor, TelemetryLoop, TelemetrySource};
use crate::transport::{
    CommandRegistry, ConfigPushHandler, DesiredConfig, DeviceTransport, StatusChangeHandler,
    TransportError, TransportFactory,
};
use crate::twin::{ReconcileOutcome, TwinSyncEngine};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Operation cancelled")]
    Cancelled,
    #[error("All credentials were rejected; the client cannot recover")]
    CredentialsExhausted,
    #[error("Coordinator is already running")]
    AlreadyRunning,
    #[error("I/O loop failed")]
    LoopFailed(#[source] LoopError),
}

/// Outcome of one `initialize()` call
#[derive(Debug)]
pub enum InitOutcome {
    /// A new handle was opened
    Initialized { generation: u64 },
    /// The state did not call for a new handle
    Skipped { state: ConnectionState },
    /// The credential list is empty
    NoCredentials,
    /// The new handle could not be created or opened; a status notification drives recovery
    OpenFailed { generation: u64, error: String },
}

/// Fixed intervals used by the coordinator and its loops
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Wait before re-initializing after a disconnect
    pub reconnect_backoff: Duration,
    /// Sleep between loop cycles
    pub poll_interval: Duration,
    /// Upper bound of one cloud-to-device receive
    pub receive_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(5),
        }
    }
}

/// What a finished run did
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub telemetry_sent: u64,
    pub commands: DrainStats,
    pub final_state: ConnectionState,
    pub credentials_remaining: usize,
    pub desired_version: i64,
    pub generations: u64,
}

/// Queued transport notification
#[derive(Debug)]
enum ControlEvent {
    Status {
        generation: u64,
        change: StatusChange,
    },
    DesiredPush {
        generation: u64,
        desired: DesiredConfig,
    },
}

/// Builder for [`ReconnectCoordinator`]
pub struct ReconnectCoordinatorBuilder<F: TransportFactory> {
    factory: F,
    credentials: CredentialSet,
    settings: CoordinatorSettings,
    twin: Option<Arc<TwinSyncEngine>>,
    commands: CommandRegistry,
    telemetry: Option<Box<dyn TelemetrySource>>,
    retry_policy: Arc<dyn RetryPolicy>,
    cancel: Option<CancellationToken>,
}

impl<F: TransportFactory> ReconnectCoordinatorBuilder<F> {
    pub fn settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn twin(mut self, twin: Arc<TwinSyncEngine>) -> Self {
        self.twin = Some(twin);
        self
    }

    pub fn commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = commands;
        self
    }

    pub fn telemetry_source(mut self, source: Box<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(source);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Share an externally owned cancellation token
    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Arc<ReconnectCoordinator<F>> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Box::new(SimulatedSensor::new()) as Box<dyn TelemetrySource>);

        Arc::new(ReconnectCoordinator {
            factory: self.factory,
            settings: self.settings,
            credentials: Mutex::new(self.credentials),
            handle: RwLock::new(None),
            state: ConnectionStateMachine::new(),
            generation: AtomicU64::new(0),
            twin: self.twin.unwrap_or_default(),
            commands: self.commands,
            retry_policy: self.retry_policy,
            control_tx,
            control_rx: std::sync::Mutex::new(Some(control_rx)),
            telemetry: std::sync::Mutex::new(Some(telemetry)),
            cancel: self.cancel.unwrap_or_default(),
            tasks: TaskTracker::new(),
            unrecoverable: AtomicBool::new(false),
        })
    }
}

/// Keeps one logical connection alive across failures and credential rotation
pub struct ReconnectCoordinator<F: TransportFactory> {
    factory: F,
    settings: CoordinatorSettings,
    /// The exclusive lock
    credentials: Mutex<CredentialSet>,
    /// Published live handle
    handle: RwLock<Option<Arc<F::Transport>>>,
    state: ConnectionStateMachine,
    generation: AtomicU64,
    twin: Arc<TwinSyncEngine>,
    commands: CommandRegistry,
    retry_policy: Arc<dyn RetryPolicy>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
    telemetry: std::sync::Mutex<Option<Box<dyn TelemetrySource>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    unrecoverable: AtomicBool,
}

impl<F: TransportFactory> ReconnectCoordinator<F> {
    pub fn builder(
        factory: F,
        credentials: impl IntoIterator<Item = Credential>,
    ) -> ReconnectCoordinatorBuilder<F> {
        ReconnectCoordinatorBuilder {
            factory,
            credentials: CredentialSet::new(credentials),
            settings: CoordinatorSettings::default(),
            twin: None,
            commands: CommandRegistry::new(),
            telemetry: None,
            retry_policy: Arc::new(RetryClassifier),
            cancel: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn status(&self) -> StatusChange {
        self.state.snapshot()
    }

    pub fn state_machine(&self) -> &ConnectionStateMachine {
        &self.state
    }

    pub fn active_handle(&self) -> Option<Arc<F::Transport>> {
        match self.handle.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn credentials_remaining(&self) -> usize {
        self.credentials.lock().await.len()
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable.load(Ordering::Acquire)
    }

    /// Generation of the most recently created handle; 0 before the first one
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn twin(&self) -> &Arc<TwinSyncEngine> {
        &self.twin
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Raise the single cancellation signal
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.cancel.cancel();
    }

    fn replace_handle(&self, next: Option<Arc<F::Transport>>) -> Option<Arc<F::Transport>> {
        let mut slot = match self.handle.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *slot, next)
    }

    async fn acquire(
        &self,
        purpose: &'static str,
    ) -> Result<MutexGuard<'_, CredentialSet>, CoordinatorError> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(purpose, "Exclusive lock acquisition cancelled");
                Err(CoordinatorError::Cancelled)
            }
            guard = self.credentials.lock() => {
                debug!(purpose, remaining = guard.len(), "Exclusive lock acquired");
                Ok(guard)
            }
        }
    }

    /// Replace the live handle with a fresh one built from the current credential
    ///
    /// Safe to call concurrently: the state is re-checked under the exclusive lock,
    /// so racing callers create at most one new handle.
    pub async fn initialize(&self) -> Result<InitOutcome, CoordinatorError> {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Disabled
        ) {
            debug!(state = %state, "Initialize skipped before locking");
            return Ok(InitOutcome::Skipped { state });
        }

        let credentials = self.acquire("initialize").await?;
        let outcome = self.initialize_locked(&credentials).await;
        drop(credentials);
        debug!("Exclusive lock released");
        outcome
    }

    async fn initialize_locked(
        &self,
        credentials: &CredentialSet,
    ) -> Result<InitOutcome, CoordinatorError> {
        let credential = match credentials.current() {
            Ok(credential) => credential.clone(),
            Err(_) => {
                self.mark_exhausted();
                return Ok(InitOutcome::NoCredentials);
            }
        };

        let state = self.state();
        if !should_reinitialize(state, credentials.any()) {
            debug!(state = %state, "Initialize skipped after locking");
            return Ok(InitOutcome::Skipped { state });
        }

        // Events from the previous handle, its close included, are now stale
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let span = connection_span!(generation, credential = %credential);

        self.open_new_handle(generation, &credential)
            .instrument(span)
            .await
    }

    fn mark_exhausted(&self) {
        error!("No credentials remain, stopping the client");
        self.unrecoverable.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    async fn open_new_handle(
        &self,
        generation: u64,
        credential: &Credential,
    ) -> Result<InitOutcome, CoordinatorError> {
        if let Some(previous) = self.replace_handle(None) {
            match previous.close().await {
                Ok(()) => debug!("Previous handle closed"),
                Err(TransportError::Unauthorized(_)) => {
                    debug!("Ignoring authorization failure while closing previous handle")
                }
                Err(e) => warn!(
                    error = %sanitize_error_message(&e.to_string()),
                    "Failed to close previous handle cleanly"
                ),
            }
        }

        let handle = match self.factory.create(credential) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                let error = sanitize_error_message(&e.to_string());
                warn!(error = %error, "Failed to create transport handle");
                self.report_create_failure(generation, &e);
                return Ok(InitOutcome::OpenFailed { generation, error });
            }
        };
        handle.set_status_change_handler(self.status_handler(generation));
        handle.set_retry_policy(Arc::clone(&self.retry_policy));
        self.replace_handle(Some(Arc::clone(&handle)));

        info!("Opening connection");
        let before_open = self.state.snapshot();
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            result = handle.open() => result,
        };

        match opened {
            Ok(()) => {}
            Err(TransportError::Cancelled) => {
                info!("Open cancelled");
                return Err(CoordinatorError::Cancelled);
            }
            Err(e) => {
                let error = sanitize_error_message(&e.to_string());
                warn!(error = %error, "Failed to open connection");
                return Ok(InitOutcome::OpenFailed { generation, error });
            }
        }

        // A transition recorded while opening is newer than this success
        self.state
            .record_if(before_open, ConnectionState::Connected, None);

        if let Err(e) = handle
            .set_config_push_handler(self.config_push_handler(generation))
            .await
        {
            warn!(error = %e, "Failed to install desired-configuration handler");
        }
        for (name, command) in &self.commands {
            if let Err(e) = handle.set_command_handler(name, Arc::clone(command)).await {
                warn!(method = %name, error = %e, "Failed to install direct-method handler");
            }
        }

        self.spawn_twin_round(Arc::clone(&handle), None);
        info!("Connection initialized");
        Ok(InitOutcome::Initialized { generation })
    }

    /// No handle exists to report the failure, so report it on its behalf
    fn report_create_failure(&self, generation: u64, error: &TransportError) {
        let reason = if error.is_unauthorized() {
            DisconnectReason::BadCredential
        } else {
            DisconnectReason::CommunicationError
        };
        (self.status_handler(generation))(ConnectionState::Disconnected, Some(reason));
    }

    fn status_handler(&self, generation: u64) -> StatusChangeHandler {
        let tx = self.control_tx.clone();
        Arc::new(move |state, reason| {
            let event = ControlEvent::Status {
                generation,
                change: StatusChange::new(state, reason),
            };
            if tx.send(event).is_err() {
                debug!(generation, "Control channel closed, status change dropped");
            }
        })
    }

    fn config_push_handler(&self, generation: u64) -> ConfigPushHandler {
        let tx = self.control_tx.clone();
        Arc::new(move |desired| {
            if tx
                .send(ControlEvent::DesiredPush {
                    generation,
                    desired,
                })
                .is_err()
            {
                debug!(generation, "Control channel closed, desired push dropped");
            }
        })
    }

    /// Apply one reported transition
    ///
    /// Never fails: errors from re-initialization are logged here.
    pub async fn on_status_changed(
        &self,
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    ) {
        self.state.record(state, reason);

        match (state, reason) {
            (ConnectionState::Connected, _) => {
                if let Some(handle) = self.active_handle() {
                    self.spawn_twin_round(handle, None);
                }
            }
            (ConnectionState::DisconnectedRetrying, _) | (ConnectionState::Disabled, _) => {}
            (ConnectionState::Disconnected, Some(DisconnectReason::BadCredential)) => {
                self.fail_over().await;
            }
            (
                ConnectionState::Disconnected,
                Some(
                    DisconnectReason::DeviceDisabled
                    | DisconnectReason::RetryExpired
                    | DisconnectReason::CommunicationError,
                ),
            ) => {
                if self.backoff().await {
                    self.reinitialize().await;
                }
            }
            (ConnectionState::Disconnected, reason) => {
                error!(
                    reason = reason.map_or("none", |r| r.as_str()),
                    "Unexpected disconnect reason, not reconnecting"
                );
            }
        }
    }

    async fn backoff(&self) -> bool {
        debug!(
            backoff_ms = self.settings.reconnect_backoff.as_millis() as u64,
            "Waiting before reconnecting"
        );
        let waited = interruptible_sleep(&self.cancel, self.settings.reconnect_backoff).await;
        if !waited {
            debug!("Reconnect backoff cancelled");
        }
        waited
    }

    async fn fail_over(&self) {
        if !self.backoff().await {
            return;
        }

        let remaining = match self.acquire("demote credential").await {
            Ok(mut credentials) => {
                if let Some(rejected) = credentials.demote_current() {
                    warn!(
                        credential = %rejected,
                        remaining = credentials.len(),
                        "Credential rejected, removed from fallback list"
                    );
                }
                credentials.len()
            }
            Err(_) => return,
        };

        if remaining > 0 {
            self.reinitialize().await;
        } else {
            self.mark_exhausted();
        }
    }

    async fn reinitialize(&self) {
        match self.initialize().await {
            Ok(InitOutcome::Initialized { generation }) => {
                info!(generation, "Reconnected")
            }
            Ok(outcome) => debug!(?outcome, "Reconnect attempt finished"),
            Err(CoordinatorError::Cancelled) => debug!("Reconnect cancelled"),
            Err(e) => error!(error = %e, "Reconnect failed"),
        }
    }

    fn spawn_twin_round(&self, handle: Arc<F::Transport>, desired: Option<DesiredConfig>) {
        let twin = Arc::clone(&self.twin);
        let cancel = self.cancel.clone();
        let span = crate::twin_span!(local_version = twin.local_version());

        self.tasks.spawn(
            async move {
                let result = match desired {
                    Some(desired) => twin.apply_desired(&*handle, desired, &cancel).await,
                    None => twin.fetch_and_reconcile(&*handle, &cancel).await,
                };
                match result {
                    Ok(ReconcileOutcome::Applied { version, keys, .. }) => {
                        debug!(version, keys, "Twin round applied")
                    }
                    Ok(outcome) => debug!(?outcome, "Twin round finished"),
                    Err(e) => warn!(
                        error = %sanitize_error_message(&e.to_string()),
                        "Twin round failed"
                    ),
                }
            }
            .instrument(span),
        );
    }

    async fn process_control_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ControlEvent>,
    ) {
        debug!("Control event processor started");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let current = self.generation();
            match event {
                ControlEvent::Status { generation, change } if generation == current => {
                    self.on_status_changed(change.state, change.reason).await;
                }
                ControlEvent::DesiredPush {
                    generation,
                    desired,
                } if generation == current => {
                    if let Some(handle) = self.active_handle() {
                        self.spawn_twin_round(handle, Some(desired));
                    }
                }
                ControlEvent::Status { generation, change } => {
                    debug!(
                        generation,
                        current,
                        state = %change.state,
                        "Dropping status change from a replaced handle"
                    );
                }
                ControlEvent::DesiredPush { generation, .. } => {
                    debug!(generation, current, "Dropping desired push from a replaced handle");
                }
            }
        }
        debug!("Control event processor stopped");
    }

    fn take_run_parts(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<ControlEvent>, Box<dyn TelemetrySource>), CoordinatorError>
    {
        let events = match self.control_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(CoordinatorError::AlreadyRunning)?;
        let source = match self.telemetry.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(CoordinatorError::AlreadyRunning)?;
        Ok((events, source))
    }

    /// Connect, run both I/O loops until cancelled, then tear down once
    pub async fn run(self: Arc<Self>) -> Result<RunSummary, CoordinatorError> {
        let (events, source) = self.take_run_parts()?;

        let processor = tokio::spawn(Arc::clone(&self).process_control_events(events));

        match self.initialize().await {
            Ok(outcome) => info!(?outcome, "Initial connection attempt finished"),
            Err(CoordinatorError::Cancelled) => debug!("Initial connection cancelled"),
            Err(e) => error!(error = %e, "Initial connection attempt failed"),
        }

        let telemetry = TelemetryLoop::new(Arc::clone(&self), source, self.settings.poll_interval);
        let drain = CommandDrainLoop::new(
            Arc::clone(&self),
            self.settings.poll_interval,
            self.settings.receive_timeout,
        );

        let telemetry_task = spawn_loop(
            self.cancel.clone(),
            "telemetry",
            telemetry.run(self.cancel.clone()),
        );
        let drain_task = spawn_loop(
            self.cancel.clone(),
            "commands",
            drain.run(self.cancel.clone()),
        );
        let (telemetry_result, drain_result) = tokio::join!(
            join_loop("telemetry", telemetry_task),
            join_loop("commands", drain_task)
        );

        self.teardown(processor).await;

        if self.is_unrecoverable() {
            return Err(CoordinatorError::CredentialsExhausted);
        }
        let telemetry_sent = telemetry_result.map_err(CoordinatorError::LoopFailed)?;
        let commands = drain_result.map_err(CoordinatorError::LoopFailed)?;

        let summary = RunSummary {
            telemetry_sent,
            commands,
            final_state: self.state(),
            credentials_remaining: self.credentials_remaining().await,
            desired_version: self.twin.local_version(),
            generations: self.generation(),
        };
        info!(
            telemetry_sent = summary.telemetry_sent,
            commands_acknowledged = summary.commands.acknowledged,
            desired_version = summary.desired_version,
            "Run finished"
        );
        Ok(summary)
    }

    async fn teardown(&self, processor: JoinHandle<()>) {
        self.cancel.cancel();

        if let Err(e) = processor.await {
            error!(error = %e, "Control event processor panicked");
        }

        self.tasks.close();
        self.tasks.wait().await;

        // Final close happens outside the exclusive lock
        if let Some(handle) = self.replace_handle(None) {
            match handle.close().await {
                Ok(()) => info!("Connection closed"),
                Err(e) => warn!(
                    error = %sanitize_error_message(&e.to_string()),
                    "Failed to close connection cleanly"
                ),
            }
        }
    }
}

fn spawn_loop<T, Fut>(
    cancel: CancellationToken,
    loop_name: &'static str,
    work: Fut,
) -> JoinHandle<Result<T, LoopError>>
where
    T: Send + 'static,
    Fut: std::future::Future<Output = Result<T, LoopError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = work.await;
        if let Err(e) = &result {
            error!(loop_name, error = %e, "Loop failed, stopping the client");
            cancel.cancel();
        }
        result
    })
}

async fn join_loop<T>(
    loop_name: &'static str,
    task: JoinHandle<Result<T, LoopError>>,
) -> Result<T, LoopError> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(LoopError::Aborted {
            loop_name,
            reason: e.to_string(),
        }),
    }
}

impl<F: TransportFactory> ConnectionView for ReconnectCoordinator<F> {
    type Transport = F::Transport;

    fn state(&self) -> ConnectionState {
        ReconnectCoordinator::state(self)
    }

    fn active_handle(&self) -> Option<Arc<F::Transport>> {
        ReconnectCoordinator::active_handle(self)
    }
}

impl<F: TransportFactory> std::fmt::Debug for ReconnectCoordinator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectCoordinator")
            .field("status", &self.state.snapshot())
            .field("generation", &self.generation())
            .field("unrecoverable", &self.is_unrecoverable())
            .finish_non_exhaustive()
    }
}
