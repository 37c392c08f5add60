//! Rotating secrets: the unit of key material.

use tagwire_crypto::SecretBytes;

use crate::{
    ids::{Endpoint, SecretId},
    window::WindowState,
};

/// One period's secret for one endpoint.
///
/// Cloning copies the secret bytes; each copy zeroes its own buffer when
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatingSecret {
    /// Endpoint the secret belongs to
    pub endpoint: Endpoint,
    /// Rotation period
    pub period: u64,
    /// Raw secret
    pub secret: SecretBytes,
    /// Reordering window for incoming streams
    pub window: WindowState,
    /// Next outgoing stream number
    pub outgoing: u64,
}

impl RotatingSecret {
    /// Fresh secret: empty reordering window, no outgoing streams yet.
    pub fn new(endpoint: Endpoint, period: u64, secret: SecretBytes) -> Self {
        Self { endpoint, period, secret, window: WindowState::default(), outgoing: 0 }
    }

    /// Storage key of this secret.
    pub fn id(&self) -> SecretId {
        self.endpoint.secret_id(self.period)
    }
}
