//! Identifiers for contacts, transports, endpoints and secrets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Local identifier of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub u64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact:{}", self.0)
    }
}

/// Name of a transport plugin (e.g. `"tcp"`, `"bt"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportId(String);

impl TransportId {
    /// Wrap a transport name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Transport name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (contact, transport) pair: the unit at which secrets rotate.
///
/// # Invariants
///
/// - Exactly one of the two peers of an endpoint has `alice == true`. The
///   flag is fixed when the endpoint is created.
/// - `epoch` is the creation time in milliseconds since the Unix epoch and
///   is identical on both peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Remote contact
    pub contact: ContactId,
    /// Transport the secrets are scoped to
    pub transport: TransportId,
    /// Creation time (ms since Unix epoch), anchor of the rotation schedule
    pub epoch: u64,
    /// Symmetry breaker for key derivation
    pub alice: bool,
}

impl Endpoint {
    /// Identifier of this endpoint's secret for `period`.
    pub fn secret_id(&self, period: u64) -> SecretId {
        SecretId { contact: self.contact, transport: self.transport.clone(), period }
    }
}

/// Key of one rotating secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretId {
    /// Remote contact
    pub contact: ContactId,
    /// Transport
    pub transport: TransportId,
    /// Rotation period
    pub period: u64,
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.contact, self.transport, self.period)
    }
}
