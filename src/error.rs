//! Crate-level error types
//!
//! Each layer owns its `thiserror` enum; `HubError` gathers them for the binary.
//! Anything that may end up in a log line passes through `sanitize_error_message`
//! first, since transport errors can echo connection strings back.

use crate::config::ConfigError;
use crate::connection::{should_retry, CoordinatorError, CredentialError};
use crate::transport::TransportError;
use crate::twin::TwinError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Main error type for the device client
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Twin error: {0}")]
    Twin(#[from] TwinError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HubError {
    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Display text with secrets removed
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Failure that stopped one of the long-running I/O loops
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("{loop_name} loop stopped on non-retryable error")]
    Fatal {
        loop_name: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("{loop_name} loop aborted: {reason}")]
    Aborted {
        loop_name: &'static str,
        reason: String,
    },
}

impl LoopError {
    /// Decide whether a loop survives `error`
    ///
    /// Cancellation, authorization failures (left to the status-change path) and
    /// retryable failures are logged and swallowed; anything else stops the loop.
    pub fn escalate(loop_name: &'static str, error: TransportError) -> Result<(), LoopError> {
        if error.is_cancelled() {
            debug!(loop_name, "Loop operation cancelled");
            return Ok(());
        }

        let message = sanitize_error_message(&error.to_string());
        if error.is_unauthorized() || should_retry(&error) {
            warn!(loop_name, error = %message, "Loop operation failed, continuing");
            return Ok(());
        }

        error!(loop_name, error = %message, "Loop operation failed with non-retryable error");
        Err(LoopError::Fatal {
            loop_name,
            source: error,
        })
    }
}

/// Result type for device client operations
pub type HubResult<T> = Result<T, HubError>;

const MAX_MESSAGE_LEN: usize = 500;

static SAS_FIELD: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(SharedAccessSignature|SharedAccessKey)=[^;]*").ok());

static SAS_SIG: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)\bsig=[^&;\s]*").ok());

static GENERIC_SECRET: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

fn redact(pattern: &Lazy<Option<Regex>>, text: String, replacement: &str) -> String {
    match &**pattern {
        Some(re) => re.replace_all(&text, replacement).into_owned(),
        None => text,
    }
}

/// Remove credentials from a message before it is logged or printed
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = redact(&SAS_FIELD, message.to_string(), "${1}=***");
    let sanitized = redact(&SAS_SIG, sanitized, "sig=***");
    let mut sanitized = redact(&GENERIC_SECRET, sanitized, "${1}=***");

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}
