use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{SecretStore, StorageError};
use crate::{
    ids::{ContactId, SecretId, TransportId},
    secret::RotatingSecret,
    window::WindowState,
};

/// In-memory secret store for testing and simulation
///
/// All state is wrapped in Arc<Mutex<>> to allow Clone and concurrent
/// access. Uses `lock().expect()` which will panic if the mutex is poisoned,
/// acceptable for test code. Removed secrets are dropped, which zeroes them.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    secrets: BTreeMap<SecretId, RotatingSecret>,
    latencies: BTreeMap<TransportId, Duration>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn secret_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").secrets.len()
    }

    /// Copy of one stored secret, for assertions.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn secret(&self, id: &SecretId) -> Option<RotatingSecret> {
        self.inner.lock().expect("Mutex poisoned").secrets.get(id).cloned()
    }
}

impl SecretStore for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn load_secrets(&self) -> Result<Vec<RotatingSecret>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.secrets.values().cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn add_secrets(&self, secrets: &[RotatingSecret]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        for secret in secrets {
            inner.secrets.insert(secret.id(), secret.clone());
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn remove_secrets(&self, ids: &[SecretId]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        for id in ids {
            inner.secrets.remove(id);
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn remove_contact(&self, contact: ContactId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.secrets.retain(|id, _| id.contact != contact);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn load_transport_latencies(&self) -> Result<BTreeMap<TransportId, Duration>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").latencies.clone())
    }

    #[allow(clippy::expect_used)]
    fn set_transport_latency(
        &self,
        transport: &TransportId,
        max_latency: Duration,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.latencies.insert(transport.clone(), max_latency);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn remove_transport(&self, transport: &TransportId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.latencies.remove(transport);
        inner.secrets.retain(|id, _| id.transport != *transport);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn set_reordering_window(
        &self,
        id: &SecretId,
        window: WindowState,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        let secret = inner.secrets.get_mut(id).ok_or_else(|| StorageError::NotFound(id.clone()))?;
        secret.window = window;
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn increment_stream_counter(&self, id: &SecretId) -> Result<Option<u64>, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.secrets.get_mut(id).map(|secret| {
            let stream_number = secret.outgoing;
            secret.outgoing += 1;
            stream_number
        }))
    }
}

#[cfg(test)]
mod tests {
    use tagwire_crypto::SecretBytes;

    use super::*;
    use crate::ids::Endpoint;

    fn secret(contact: u64, transport: &str, period: u64) -> RotatingSecret {
        let endpoint = Endpoint {
            contact: ContactId(contact),
            transport: TransportId::new(transport),
            epoch: 0,
            alice: true,
        };
        RotatingSecret::new(endpoint, period, SecretBytes::new([period as u8; 32]))
    }

    #[test]
    fn add_then_load() {
        let storage = MemoryStorage::new();
        storage.add_secrets(&[secret(1, "tcp", 0), secret(1, "tcp", 1)]).unwrap();

        let loaded = storage.load_secrets().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], secret(1, "tcp", 0));
    }

    #[test]
    fn stream_counter_increments() {
        let storage = MemoryStorage::new();
        let s = secret(1, "tcp", 3);
        storage.add_secrets(&[s.clone()]).unwrap();

        assert_eq!(storage.increment_stream_counter(&s.id()).unwrap(), Some(0));
        assert_eq!(storage.increment_stream_counter(&s.id()).unwrap(), Some(1));
        assert_eq!(storage.secret(&s.id()).unwrap().outgoing, 2);
    }

    #[test]
    fn stream_counter_for_missing_secret() {
        let storage = MemoryStorage::new();
        let id = secret(1, "tcp", 3).id();
        assert_eq!(storage.increment_stream_counter(&id).unwrap(), None);
    }

    #[test]
    fn window_for_missing_secret_is_not_found() {
        let storage = MemoryStorage::new();
        let id = secret(1, "tcp", 3).id();
        let result = storage.set_reordering_window(&id, WindowState::default());
        assert_eq!(result, Err(StorageError::NotFound(id)));
    }

    #[test]
    fn remove_contact_and_transport() {
        let storage = MemoryStorage::new();
        storage
            .add_secrets(&[secret(1, "tcp", 0), secret(2, "tcp", 0), secret(2, "bt", 0)])
            .unwrap();
        storage.set_transport_latency(&TransportId::new("bt"), Duration::from_secs(5)).unwrap();

        storage.remove_contact(ContactId(1)).unwrap();
        assert_eq!(storage.secret_count(), 2);

        storage.remove_transport(&TransportId::new("bt")).unwrap();
        assert_eq!(storage.secret_count(), 1);
        assert!(storage.load_transport_latencies().unwrap().is_empty());
    }
}
