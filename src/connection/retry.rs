//! Retry classification for transport errors
//!
//! Authorization failures are left to the status-change path, which demotes the
//! credential. TLS and certificate failures point at configuration, not the
//! network, so they are never retried either.

use crate::transport::TransportError;
use std::error::Error as StdError;
use std::fmt::Debug;

/// Decides whether the operation that produced an error should be retried
pub trait RetryPolicy: Send + Sync + Debug {
    fn should_retry(&self, error: &TransportError) -> bool;
}

/// Default policy installed on every new transport handle
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryClassifier;

impl RetryPolicy for RetryClassifier {
    fn should_retry(&self, error: &TransportError) -> bool {
        should_retry(error)
    }
}

/// True unless the error is an authorization failure, a TLS failure or a cancellation
pub fn should_retry(error: &TransportError) -> bool {
    match error {
        TransportError::Unauthorized(_) | TransportError::Cancelled => false,
        _ => !chain_has_tls_failure(error),
    }
}

/// True when some link of the `source()` chain is a network failure and no link is a
/// TLS failure
pub fn is_network_error_chain(error: &(dyn StdError + 'static)) -> bool {
    let mut network = false;
    for link in error_chain(error) {
        if is_tls_link(link) {
            return false;
        }
        network |= is_network_link(link);
    }
    network
}

fn chain_has_tls_failure(error: &TransportError) -> bool {
    error_chain(error).any(is_tls_link)
}

fn error_chain<'a>(
    error: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(error), |&e| e.source())
}

fn is_tls_link(link: &(dyn StdError + 'static)) -> bool {
    if let Some(TransportError::Tls(_)) = link.downcast_ref::<TransportError>() {
        return true;
    }
    let text = link.to_string().to_ascii_lowercase();
    text.contains("certificate") || text.contains("tls handshake")
}

fn is_network_link(link: &(dyn StdError + 'static)) -> bool {
    if let Some(error) = link.downcast_ref::<TransportError>() {
        return matches!(
            error,
            TransportError::Io(_)
                | TransportError::Timeout(_)
                | TransportError::ChannelClosed(_)
                | TransportError::DeviceNotFound(_)
        );
    }
    link.is::<std::io::Error>() || link.is::<tokio::time::error::Elapsed>()
}
