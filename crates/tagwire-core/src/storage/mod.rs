//! Secret store abstraction
//!
//! Trait-based abstraction for persisting rotating secrets, their reordering
//! windows and outgoing stream counters, plus the maximum latency of each
//! transport. The trait is synchronous: callers run it from the rotation
//! thread or from connection workers, never from an async context.

mod chaotic;
mod error;
mod memory;

use std::{collections::BTreeMap, time::Duration};

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;

use crate::{
    ids::{ContactId, SecretId, TransportId},
    secret::RotatingSecret,
    window::WindowState,
};

/// Storage for rotating secrets and transport latencies
///
/// Must be Clone (shared by the key manager and the recognizer), Send + Sync
/// (thread-safe), and synchronous. Implementations typically share internal
/// state via Arc, so clones access the same underlying storage.
///
/// # Security
///
/// Implementations hold secret key material. Records removed through
/// [`remove_secrets`](Self::remove_secrets) must not remain readable
/// through this trait afterwards.
pub trait SecretStore: Clone + Send + Sync + 'static {
    /// Load every stored secret.
    fn load_secrets(&self) -> Result<Vec<RotatingSecret>, StorageError>;

    /// Insert secrets, replacing any stored under the same id.
    fn add_secrets(&self, secrets: &[RotatingSecret]) -> Result<(), StorageError>;

    /// Remove secrets. Missing ids are ignored.
    fn remove_secrets(&self, ids: &[SecretId]) -> Result<(), StorageError>;

    /// Remove every secret of `contact`, across all transports.
    fn remove_contact(&self, contact: ContactId) -> Result<(), StorageError>;

    /// Maximum latency of every known transport.
    fn load_transport_latencies(&self) -> Result<BTreeMap<TransportId, Duration>, StorageError>;

    /// Record (or update) a transport's maximum latency.
    fn set_transport_latency(
        &self,
        transport: &TransportId,
        max_latency: Duration,
    ) -> Result<(), StorageError>;

    /// Forget a transport and remove every secret scoped to it.
    fn remove_transport(&self, transport: &TransportId) -> Result<(), StorageError>;

    /// Persist the reordering window of one secret.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` if the secret is not stored
    fn set_reordering_window(&self, id: &SecretId, window: WindowState)
    -> Result<(), StorageError>;

    /// Atomically return the next outgoing stream number of a secret and
    /// advance its counter.
    ///
    /// Returns `None` if no secret is stored under `id`.
    fn increment_stream_counter(&self, id: &SecretId) -> Result<Option<u64>, StorageError>;
}
