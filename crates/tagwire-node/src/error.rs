//! Node error types.

use std::io;

use tagwire_core::{KeyManagerError, StorageError, StreamError};
use thiserror::Error;

/// Errors that can occur in the node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid command line input or configuration (bad secret encoding,
    /// unusable bind address).
    ///
    /// Fatal at startup. Fix the configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistent storage failed to open or to answer.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Key management failed. Fatal if the wrapped error is.
    #[error("key manager error: {0}")]
    KeyManager(#[from] KeyManagerError),

    /// A secured stream failed. Fatal for that connection only.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Socket or runtime I/O failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl NodeError {
    /// True if the node cannot continue and should exit.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::KeyManager(e) => e.is_fatal(),
            Self::Storage(_) | Self::Stream(_) | Self::Transport(_) => false,
        }
    }
}
