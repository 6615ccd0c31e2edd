//! Ordered credential fallback list
//!
//! Credentials are device connection strings of the form
//! `HostName=<hub>;DeviceId=<id>;SharedAccessSignature=<token>`. Insertion order is
//! priority order and index 0 is the credential in use. A credential the hub
//! rejects is removed for good; it is never retried.

use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Credential errors
#[derive(Debug, Error, PartialEq)]
pub enum CredentialError {
    #[error("No credentials remain")]
    Exhausted,
    #[error("Malformed connection string segment: {0}")]
    Malformed(String),
    #[error("Connection string is missing {0}")]
    MissingField(&'static str),
}

/// A device connection string
///
/// `Debug` and `Display` show the hub and device only, never the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self(connection_string.into())
    }

    /// The raw connection string, secret included
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Result<ConnectionString, CredentialError> {
        ConnectionString::parse(&self.0)
    }

    /// Secret-free label for logs
    pub fn label(&self) -> String {
        match self.parse() {
            Ok(parsed) => format!("{}/{}", parsed.host_name, parsed.device_id),
            Err(_) => format!("<unparsed credential, {} chars>", self.0.len()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.label()).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Parsed connection string fields
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub shared_access_signature: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, CredentialError> {
        let mut host_name = None;
        let mut device_id = None;
        let mut module_id = None;
        let mut signature = None;

        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Signature values contain '=' themselves, split on the first one only
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| CredentialError::Malformed(redact_segment(segment)))?;

            match key.trim() {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "ModuleId" => module_id = Some(value.to_string()),
                "SharedAccessSignature" => signature = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            host_name: host_name
                .filter(|h| !h.is_empty())
                .ok_or(CredentialError::MissingField("HostName"))?,
            device_id: device_id
                .filter(|d| !d.is_empty())
                .ok_or(CredentialError::MissingField("DeviceId"))?,
            module_id,
            shared_access_signature: signature,
        })
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field(
                "shared_access_signature",
                &self.shared_access_signature.as_ref().map(|_| "***"),
            )
            .finish()
    }
}

fn redact_segment(segment: &str) -> String {
    segment.chars().take(12).collect::<String>() + "..."
}

/// Ordered, mutable list of candidate credentials
///
/// Not synchronized; the coordinator mutates it only under its exclusive lock.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    credentials: VecDeque<Credential>,
}

impl CredentialSet {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            credentials: credentials.into_iter().collect(),
        }
    }

    /// The credential in use
    pub fn current(&self) -> Result<&Credential, CredentialError> {
        self.credentials.front().ok_or(CredentialError::Exhausted)
    }

    /// Permanently drop the current credential, returning it
    pub fn demote_current(&mut self) -> Option<Credential> {
        self.credentials.pop_front()
    }

    pub fn any(&self) -> bool {
        !self.credentials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PRIMARY: &str =
        "HostName=hub.example.net;DeviceId=thermostat-01;SharedAccessSignature=SharedAccessSignature sr=hub&sig=abc%3D&se=1";

    #[test]
    fn test_parse_connection_string() {
        let parsed = ConnectionString::parse(PRIMARY).unwrap();
        assert_eq!(parsed.host_name, "hub.example.net");
        assert_eq!(parsed.device_id, "thermostat-01");
        assert_eq!(parsed.module_id, None);
        assert_eq!(
            parsed.shared_access_signature.as_deref(),
            Some("SharedAccessSignature sr=hub&sig=abc%3D&se=1")
        );
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert_eq!(
            ConnectionString::parse("DeviceId=x").unwrap_err(),
            CredentialError::MissingField("HostName")
        );
        assert_eq!(
            ConnectionString::parse("HostName=h;DeviceId=").unwrap_err(),
            CredentialError::MissingField("DeviceId")
        );
        assert!(matches!(
            ConnectionString::parse("HostName=h;garbage"),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn test_credential_never_prints_secret() {
        let credential = Credential::new(PRIMARY);
        let debug = format!("{credential:?}");
        let display = credential.to_string();

        assert!(!debug.contains("sig="));
        assert!(!display.contains("sig="));
        assert_eq!(display, "hub.example.net/thermostat-01");

        let parsed = credential.parse().unwrap();
        assert!(!format!("{parsed:?}").contains("sig="));
    }

    #[test]
    fn test_current_and_demote() {
        let mut set = CredentialSet::new([Credential::new("A"), Credential::new("B")]);

        assert_eq!(set.current().unwrap().expose(), "A");
        assert_eq!(set.demote_current().unwrap().expose(), "A");
        assert_eq!(set.current().unwrap().expose(), "B");
        assert!(set.any());

        set.demote_current();
        assert!(!set.any());
        assert_eq!(set.current().unwrap_err(), CredentialError::Exhausted);
        assert!(set.demote_current().is_none());
    }

    proptest! {
        #[test]
        fn prop_demote_shrinks_by_one_and_never_revisits(
            names in proptest::collection::vec("[a-z]{1,8}", 1..8)
        ) {
            let mut set = CredentialSet::new(names.iter().map(Credential::new));
            let mut removed = Vec::new();

            while set.any() {
                let before = set.len();
                let gone = set.demote_current().expect("non-empty");
                prop_assert_eq!(set.len(), before - 1);
                removed.push(gone);

                if let Ok(current) = set.current() {
                    // positions already demoted are never the current credential again
                    prop_assert_eq!(current.expose(), names[removed.len()].as_str());
                }
            }

            prop_assert_eq!(removed.len(), names.len());
        }
    }
}
