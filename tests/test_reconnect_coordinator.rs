//! Reconnection coordinator behaviour against the mock transport


use futures::future::join_all;
use hublink::commands::default_registry;
use hublink::connection::{
    ConnectionState, CoordinatorError, DisconnectReason, InitOutcome, ReconnectCoordinator,
};
use hublink::testing::{mock_credential, MockScript, MockTransportFactory};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fast_settings, wait_until, WAIT};

type Coordinator = ReconnectCoordinator<MockTransportFactory>;

fn coordinator(script: &Arc<MockScript>, credentials: usize) -> Arc<Coordinator> {
    ReconnectCoordinator::builder(
        MockTransportFactory::new(Arc::clone(script)),
        (0..credentials).map(mock_credential),
    )
    .settings(fast_settings())
    .commands(default_registry(Duration::from_millis(10)))
    .build()
}

#[tokio::test]
async fn test_initialize_opens_handle_and_installs_handlers() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 2);

    let outcome = coordinator.initialize().await.unwrap();
    assert!(matches!(outcome, InitOutcome::Initialized { generation: 1 }));
    assert_eq!(coordinator.state(), ConnectionState::Connected);
    assert_eq!(script.live_handles(), 1);
    assert_eq!(
        script.installed_commands(),
        vec!["IsAlive".to_string(), "StartLongRunning".to_string()]
    );
    assert!(script.retry_policy_installed());
    assert!(coordinator.active_handle().is_some());
}

#[tokio::test]
async fn test_initialize_skipped_while_connected() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 1);

    coordinator.initialize().await.unwrap();
    let outcome = coordinator.initialize().await.unwrap();

    assert!(matches!(
        outcome,
        InitOutcome::Skipped {
            state: ConnectionState::Connected
        }
    ));
    assert_eq!(script.handle_count(), 1);
}

#[tokio::test]
async fn test_concurrent_initialize_leaves_one_live_handle() {
    let script = MockScript::new();
    script.set_open_delay(Duration::from_millis(30));
    let coordinator = coordinator(&script, 1);

    let outcomes: Vec<InitOutcome> = join_all((0..4).map(|_| coordinator.initialize()))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let initialized = outcomes
        .iter()
        .filter(|o| matches!(o, InitOutcome::Initialized { .. }))
        .count();
    assert_eq!(initialized, 1);
    assert_eq!(script.handle_count(), 1);
    assert_eq!(script.live_handles(), 1);
    assert_eq!(script.max_live_handles(), 1);
    assert_eq!(script.double_closes(), 0);
}

#[tokio::test]
async fn test_non_disconnected_states_never_touch_credentials() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 2);
    coordinator.initialize().await.unwrap();

    let transitions = [
        (
            ConnectionState::DisconnectedRetrying,
            Some(DisconnectReason::CommunicationError),
        ),
        (ConnectionState::Disabled, Some(DisconnectReason::Expected)),
        (ConnectionState::Connected, None),
        (
            ConnectionState::DisconnectedRetrying,
            Some(DisconnectReason::BadCredential),
        ),
    ];
    for (state, reason) in transitions {
        coordinator.on_status_changed(state, reason).await;
        assert_eq!(coordinator.state(), state);
        assert_eq!(coordinator.credentials_remaining().await, 2);
        assert_eq!(script.handle_count(), 1);
    }
}

#[tokio::test]
async fn test_retry_expired_reinitializes_with_same_credential() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 2);
    coordinator.initialize().await.unwrap();

    coordinator
        .on_status_changed(
            ConnectionState::Disconnected,
            Some(DisconnectReason::RetryExpired),
        )
        .await;

    assert_eq!(
        script.created_credentials(),
        vec![mock_credential(0), mock_credential(0)]
    );
    assert_eq!(coordinator.credentials_remaining().await, 2);
    assert_eq!(coordinator.state(), ConnectionState::Connected);
    assert_eq!(coordinator.generation(), 2);
    assert_eq!(script.live_handles(), 1);
    assert_eq!(script.closed_handles(), 1);
}

#[tokio::test]
async fn test_device_disabled_and_communication_error_reconnect() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 1);
    coordinator.initialize().await.unwrap();

    for reason in [
        DisconnectReason::DeviceDisabled,
        DisconnectReason::CommunicationError,
    ] {
        coordinator
            .on_status_changed(ConnectionState::Disconnected, Some(reason))
            .await;
        assert_eq!(coordinator.state(), ConnectionState::Connected);
    }
    assert_eq!(script.handle_count(), 3);
    assert_eq!(coordinator.credentials_remaining().await, 1);
}

#[tokio::test]
async fn test_unexpected_disconnect_reason_is_not_acted_on() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 2);
    coordinator.initialize().await.unwrap();

    for reason in [None, Some(DisconnectReason::Unknown), Some(DisconnectReason::Expected)] {
        coordinator
            .on_status_changed(ConnectionState::Disconnected, reason)
            .await;
    }

    assert_eq!(script.handle_count(), 1);
    assert_eq!(coordinator.credentials_remaining().await, 2);
    assert_eq!(coordinator.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_bad_credential_twice_exhausts_the_set() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 2);
    coordinator.initialize().await.unwrap();

    coordinator
        .on_status_changed(
            ConnectionState::Disconnected,
            Some(DisconnectReason::BadCredential),
        )
        .await;
    assert_eq!(coordinator.credentials_remaining().await, 1);
    assert_eq!(coordinator.state(), ConnectionState::Connected);
    assert!(!coordinator.is_unrecoverable());

    coordinator
        .on_status_changed(
            ConnectionState::Disconnected,
            Some(DisconnectReason::BadCredential),
        )
        .await;

    assert_eq!(coordinator.credentials_remaining().await, 0);
    assert!(coordinator.is_unrecoverable());
    assert!(coordinator.cancellation_token().is_cancelled());
    // No third attempt, and the rejected primary is never revisited
    assert_eq!(
        script.created_credentials(),
        vec![mock_credential(0), mock_credential(1)]
    );
}

#[tokio::test]
async fn test_initialize_without_credentials() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 0);

    let outcome = coordinator.initialize().await.unwrap();
    assert!(matches!(outcome, InitOutcome::NoCredentials));
    assert_eq!(script.handle_count(), 0);
    assert!(coordinator.is_unrecoverable());
    assert!(coordinator.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn test_run_without_credentials_stops_on_its_own() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 0);

    let result = tokio::time::timeout(WAIT, Arc::clone(&coordinator).run())
        .await
        .expect("run should stop without an external signal");

    assert!(matches!(result, Err(CoordinatorError::CredentialsExhausted)));
    assert!(coordinator.is_unrecoverable());
    assert_eq!(script.handle_count(), 0);
}

#[tokio::test]
async fn test_initialize_cancelled_during_open() {
    let script = MockScript::new();
    script.set_open_delay(Duration::from_secs(30));
    let coordinator = coordinator(&script, 1);

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(WAIT, coordinator.initialize())
        .await
        .expect("initialize should observe cancellation");
    assert!(matches!(result, Err(CoordinatorError::Cancelled)));
    assert_ne!(coordinator.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_run_fails_over_to_backup_credential() {
    let script = MockScript::new();
    script.reject_credential(&mock_credential(0));
    let coordinator = coordinator(&script, 2);

    let runner = tokio::spawn(Arc::clone(&coordinator).run());

    let probe = Arc::clone(&coordinator);
    assert!(
        wait_until(WAIT, || probe.state() == ConnectionState::Connected).await,
        "backup credential should connect"
    );
    assert_eq!(
        script.created_credentials(),
        vec![mock_credential(0), mock_credential(1)]
    );
    assert_eq!(coordinator.credentials_remaining().await, 1);

    coordinator.shutdown();
    let summary = tokio::time::timeout(WAIT, runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(summary.credentials_remaining, 1);
    assert_eq!(summary.generations, 2);
    assert_eq!(script.live_handles(), 0);
    assert_eq!(script.double_closes(), 0);
}

#[tokio::test]
async fn test_run_aborts_when_every_credential_is_rejected() {
    let script = MockScript::new();
    script.reject_credential(&mock_credential(0));
    script.reject_credential(&mock_credential(1));
    let coordinator = coordinator(&script, 2);

    let result = tokio::time::timeout(WAIT, Arc::clone(&coordinator).run())
        .await
        .expect("run should stop on its own");

    assert!(matches!(result, Err(CoordinatorError::CredentialsExhausted)));
    assert!(coordinator.is_unrecoverable());
    assert_eq!(script.handle_count(), 2);
    assert_eq!(script.live_handles(), 0);
}

#[tokio::test]
async fn test_run_recovers_from_failed_open() {
    let script = MockScript::new();
    script.fail_next_opens(1);
    let coordinator = coordinator(&script, 1);

    let runner = tokio::spawn(Arc::clone(&coordinator).run());

    let probe = Arc::clone(&coordinator);
    assert!(wait_until(WAIT, || probe.state() == ConnectionState::Connected).await);
    assert_eq!(script.handle_count(), 2);
    assert_eq!(coordinator.credentials_remaining().await, 1);

    coordinator.shutdown();
    tokio::time::timeout(WAIT, runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_status_from_replaced_handle_is_ignored() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 1);

    let runner = tokio::spawn(Arc::clone(&coordinator).run());
    let probe = Arc::clone(&coordinator);
    assert!(wait_until(WAIT, || probe.state() == ConnectionState::Connected).await);

    // Drive a reconnect so the first handle is replaced
    script.emit_status(
        ConnectionState::Disconnected,
        Some(DisconnectReason::RetryExpired),
    );
    let probe = Arc::clone(&coordinator);
    assert!(
        wait_until(WAIT, || probe.generation() == 2
            && probe.state() == ConnectionState::Connected)
        .await
    );

    script.emit_status_from(
        0,
        ConnectionState::Disconnected,
        Some(DisconnectReason::CommunicationError),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(coordinator.state(), ConnectionState::Connected);
    assert_eq!(script.handle_count(), 2);

    coordinator.shutdown();
    tokio::time::timeout(WAIT, runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_run_only_once() {
    let script = MockScript::new();
    let coordinator = coordinator(&script, 1);
    coordinator.shutdown();

    let first = tokio::time::timeout(WAIT, Arc::clone(&coordinator).run())
        .await
        .unwrap();
    assert!(first.is_ok());

    let second = Arc::clone(&coordinator).run().await;
    assert!(matches!(second, Err(CoordinatorError::AlreadyRunning)));
}

#[tokio::test]
async fn test_create_failure_reports_open_failed_without_a_handle() {
    let script = MockScript::new();
    script.fail_next_creates(1);
    let coordinator = coordinator(&script, 1);

    let outcome = coordinator.initialize().await.unwrap();

    assert!(matches!(outcome, InitOutcome::OpenFailed { generation: 1, .. }));
    assert!(coordinator.active_handle().is_none());
    assert_eq!(script.handle_count(), 0);
    assert_eq!(coordinator.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_run_retries_after_failed_create() {
    let script = MockScript::new();
    script.fail_next_creates(1);
    let coordinator = coordinator(&script, 1);

    let runner = tokio::spawn(Arc::clone(&coordinator).run());

    let probe = Arc::clone(&coordinator);
    assert!(
        wait_until(WAIT, || probe.state() == ConnectionState::Connected).await,
        "a failed create should be retried after the backoff"
    );
    assert_eq!(coordinator.generation(), 2);
    assert_eq!(script.handle_count(), 1);
    assert_eq!(coordinator.credentials_remaining().await, 1);

    coordinator.shutdown();
    tokio::time::timeout(WAIT, runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_run_demotes_credential_rejected_at_create() {
    let script = MockScript::new();
    script.reject_at_create(&mock_credential(0));
    let coordinator = coordinator(&script, 2);

    let runner = tokio::spawn(Arc::clone(&coordinator).run());

    let probe = Arc::clone(&coordinator);
    assert!(
        wait_until(WAIT, || probe.state() == ConnectionState::Connected).await,
        "backup credential should connect"
    );
    assert_eq!(script.created_credentials(), vec![mock_credential(1)]);
    assert_eq!(coordinator.credentials_remaining().await, 1);

    coordinator.shutdown();
    let summary = tokio::time::timeout(WAIT, runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.generations, 2);
}
