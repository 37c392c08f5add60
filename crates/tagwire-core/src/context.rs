//! Resolved connection context.

use tagwire_crypto::SecretBytes;

use crate::ids::{ContactId, TransportId};

/// Which end of a connection the local side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection and sent the tag
    Initiator,
    /// Accepted the connection and recognised the tag
    Responder,
}

/// Everything needed to secure one connection.
///
/// Produced by `KeyManager::get_connection_context` for outgoing
/// connections and by tag recognition for incoming ones.
///
/// # Security
///
/// `secret` is this context's own copy of the period secret. It is zeroed
/// when the context is dropped, independently of the key manager's copy.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Remote contact
    pub contact: ContactId,
    /// Transport the connection runs over
    pub transport: TransportId,
    /// Rotation period of the secret
    pub period: u64,
    /// Copy of the period secret
    pub secret: SecretBytes,
    /// Stream number within the period
    pub stream_number: u32,
    /// Alice flag of the side that initiated the connection
    pub alice: bool,
    /// Local role
    pub role: Role,
}

impl ConnectionContext {
    /// True if the local side opened the connection.
    pub fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }
}
