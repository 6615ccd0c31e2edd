//! Desired-configuration reconciliation
//!
//! The hub stores a versioned desired document. When its version is ahead of the
//! locally cached one, every setting is accepted as-is, mirrored into the reported
//! document and pushed back. The local version moves only after the push succeeded,
//! so it never runs ahead of what the hub has accepted from this device.

use crate::error::sanitize_error_message;
use crate::transport::{DesiredConfig, DeviceTransport, ReportedConfig, TransportError};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Version assumed before the first reconcile round
pub const DEFAULT_INITIAL_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("Failed to fetch desired configuration")]
    Fetch(#[source] TransportError),
    #[error("Failed to push reported configuration for version {version}")]
    Push {
        version: i64,
        #[source]
        source: TransportError,
    },
}

/// Result of one reconcile round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Remote version not ahead of the local one, nothing pushed
    UpToDate { local: i64, remote: i64 },
    /// Reported document pushed and local version advanced
    Applied {
        previous: i64,
        version: i64,
        keys: usize,
    },
    /// Shutdown interrupted the round; local version unchanged
    Cancelled,
}

/// Reconciles the hub's desired document against the cached version
#[derive(Debug)]
pub struct TwinSyncEngine {
    /// Serializes rounds; holds the authoritative local version
    version: Mutex<i64>,
    /// Lock-free mirror of `version` for readers
    observed: AtomicI64,
}

impl TwinSyncEngine {
    pub fn new(initial_version: i64) -> Self {
        Self {
            version: Mutex::new(initial_version),
            observed: AtomicI64::new(initial_version),
        }
    }

    pub fn local_version(&self) -> i64 {
        self.observed.load(Ordering::Acquire)
    }

    /// Fetch the desired document and converge towards it
    pub async fn fetch_and_reconcile<T>(
        &self,
        transport: &T,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, TwinError>
    where
        T: DeviceTransport + ?Sized,
    {
        let mut local = self.version.lock().await;

        let desired = match cancellable(cancel, transport.get_desired_config()).await {
            Some(Ok(desired)) => desired,
            Some(Err(TransportError::Cancelled)) | None => {
                debug!(local_version = *local, "Desired configuration fetch cancelled");
                return Ok(ReconcileOutcome::Cancelled);
            }
            Some(Err(e)) => {
                warn!(
                    local_version = *local,
                    error = %sanitize_error_message(&e.to_string()),
                    "Failed to fetch desired configuration"
                );
                return Err(TwinError::Fetch(e));
            }
        };

        self.converge(&mut local, transport, desired, cancel).await
    }

    /// Converge towards a desired document pushed by the hub
    pub async fn apply_desired<T>(
        &self,
        transport: &T,
        desired: DesiredConfig,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, TwinError>
    where
        T: DeviceTransport + ?Sized,
    {
        let mut local = self.version.lock().await;
        self.converge(&mut local, transport, desired, cancel).await
    }

    async fn converge<T>(
        &self,
        local: &mut i64,
        transport: &T,
        desired: DesiredConfig,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, TwinError>
    where
        T: DeviceTransport + ?Sized,
    {
        let remote = desired.version;
        if remote <= *local {
            debug!(
                local_version = *local,
                remote_version = remote,
                "Desired configuration up to date"
            );
            return Ok(ReconcileOutcome::UpToDate {
                local: *local,
                remote,
            });
        }

        let reported = reported_document(&desired);
        let keys = reported.len();

        match cancellable(cancel, transport.push_reported_config(&reported)).await {
            Some(Ok(())) => {}
            Some(Err(TransportError::Cancelled)) | None => {
                info!(
                    local_version = *local,
                    remote_version = remote,
                    "Reported configuration push cancelled"
                );
                return Ok(ReconcileOutcome::Cancelled);
            }
            Some(Err(source)) => {
                warn!(
                    local_version = *local,
                    remote_version = remote,
                    error = %sanitize_error_message(&source.to_string()),
                    "Failed to push reported configuration"
                );
                return Err(TwinError::Push {
                    version: remote,
                    source,
                });
            }
        }

        let previous = *local;
        *local = remote;
        self.observed.store(remote, Ordering::Release);

        info!(
            previous_version = previous,
            version = remote,
            keys,
            "Desired configuration reconciled"
        );

        Ok(ReconcileOutcome::Applied {
            previous,
            version: remote,
            keys,
        })
    }
}

impl Default for TwinSyncEngine {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_VERSION)
    }
}

/// Every non-metadata desired key, accepted unconditionally
pub fn reported_document(desired: &DesiredConfig) -> ReportedConfig {
    desired
        .settings()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

async fn cancellable<F, T>(cancel: &CancellationToken, operation: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = operation => Some(result),
    }
}
