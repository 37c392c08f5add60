//! Storage error types.
//!
//! - `NotFound`: Requested secret doesn't exist
//! - `Serialization`: Failed to encode/decode a record
//! - `Io`: Underlying storage system errors

use thiserror::Error;

use crate::ids::SecretId;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Secret not found
    #[error("secret not found: {0}")]
    NotFound(SecretId),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if retrying the operation later may succeed.
    ///
    /// Rotation retries transient failures on its next cycle. A permanent
    /// failure makes the key manager halt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
