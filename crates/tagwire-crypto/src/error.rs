//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from cryptographic operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD authentication tag did not verify (tampered or wrong key)
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The AEAD refused to encrypt (buffer beyond the cipher's limits)
    #[error("encryption failed")]
    EncryptionFailed,

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },
}

impl CryptoError {
    /// Returns true if this error indicates possible tampering.
    ///
    /// Integrity failures tear down the stream and are never retried.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }
}
