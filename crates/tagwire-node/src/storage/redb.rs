//! Redb-backed durable secret storage.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! trait operation is one transaction, so a stream counter increment is
//! durable before the stream number is handed out.

use std::{collections::BTreeMap, fmt, path::Path, sync::Arc, time::Duration};

use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use tagwire_core::{
    ContactId, Endpoint, RotatingSecret, SecretId, SecretStore, StorageError, TransportId,
    WindowState,
};
use tagwire_crypto::{SECRET_LENGTH, SecretBytes};
use zeroize::Zeroize;

/// Table: secrets
/// Key: contact (8 bytes BE) ‖ period (8 bytes BE) ‖ transport name (UTF-8)
/// Value: CBOR-encoded `SecretRecord`
const SECRETS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("secrets");

/// Table: transports
/// Key: transport name
/// Value: maximum latency in milliseconds
const TRANSPORTS: TableDefinition<&str, u64> = TableDefinition::new("transports");

/// Length of the fixed part of a secret key
const KEY_PREFIX_LENGTH: usize = 16;

fn io_error(err: impl fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn serialization_error(err: impl fmt::Display) -> StorageError {
    StorageError::Serialization(err.to_string())
}

/// Persisted form of a [`RotatingSecret`]. Zeroes its key bytes on drop.
#[derive(Serialize, Deserialize)]
struct SecretRecord {
    contact: ContactId,
    transport: TransportId,
    epoch: u64,
    alice: bool,
    period: u64,
    secret: [u8; SECRET_LENGTH],
    window: WindowState,
    outgoing: u64,
}

impl Drop for SecretRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl From<&RotatingSecret> for SecretRecord {
    fn from(secret: &RotatingSecret) -> Self {
        Self {
            contact: secret.endpoint.contact,
            transport: secret.endpoint.transport.clone(),
            epoch: secret.endpoint.epoch,
            alice: secret.endpoint.alice,
            period: secret.period,
            secret: *secret.secret.as_bytes(),
            window: secret.window,
            outgoing: secret.outgoing,
        }
    }
}

impl SecretRecord {
    fn to_secret(&self) -> RotatingSecret {
        let endpoint = Endpoint {
            contact: self.contact,
            transport: self.transport.clone(),
            epoch: self.epoch,
            alice: self.alice,
        };
        let mut secret = RotatingSecret::new(endpoint, self.period, SecretBytes::new(self.secret));
        secret.window = self.window;
        secret.outgoing = self.outgoing;
        secret
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        ciborium::from_reader(bytes).map_err(serialization_error)
    }
}

fn secret_key(id: &SecretId) -> Vec<u8> {
    let transport = id.transport.as_str().as_bytes();
    let mut key = Vec::with_capacity(KEY_PREFIX_LENGTH + transport.len());
    key.extend_from_slice(&id.contact.0.to_be_bytes());
    key.extend_from_slice(&id.period.to_be_bytes());
    key.extend_from_slice(transport);
    key
}

fn key_contact(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn key_transport(key: &[u8]) -> Option<&[u8]> {
    key.get(KEY_PREFIX_LENGTH..)
}

fn load_record(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<SecretRecord>, StorageError> {
    match table.get(key).map_err(io_error)? {
        Some(value) => SecretRecord::decode(value.value()).map(Some),
        None => Ok(None),
    }
}

fn store_record(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    key: &[u8],
    record: &SecretRecord,
) -> Result<(), StorageError> {
    let mut bytes = Vec::with_capacity(128);
    let result = ciborium::into_writer(record, &mut bytes)
        .map_err(serialization_error)
        .and_then(|()| table.insert(key, bytes.as_slice()).map(|_| ()).map_err(io_error));
    bytes.zeroize();
    result
}

/// Durable secret store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (SECRETS, TRANSPORTS).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_error)?;

        let txn = db.begin_write().map_err(io_error)?;
        {
            let _ = txn.open_table(SECRETS).map_err(io_error)?;
            let _ = txn.open_table(TRANSPORTS).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Remove every secret whose key matches `predicate`.
    fn remove_matching(&self, predicate: impl Fn(&[u8]) -> bool) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;
        let removed = {
            let mut table = txn.open_table(SECRETS).map_err(io_error)?;

            let mut doomed = Vec::new();
            for entry in table.iter().map_err(io_error)? {
                let (key, _) = entry.map_err(io_error)?;
                if predicate(key.value()) {
                    doomed.push(key.value().to_vec());
                }
            }
            for key in &doomed {
                table.remove(key.as_slice()).map_err(io_error)?;
            }
            doomed.len()
        };
        txn.commit().map_err(io_error)?;
        Ok(removed)
    }

    /// Apply `update` to one stored record inside a write transaction.
    ///
    /// Returns `None` without writing if the record does not exist.
    fn update_record<T>(
        &self,
        id: &SecretId,
        update: impl FnOnce(&mut SecretRecord) -> T,
    ) -> Result<Option<T>, StorageError> {
        let key = secret_key(id);
        let txn = self.db.begin_write().map_err(io_error)?;
        let outcome = {
            let mut table = txn.open_table(SECRETS).map_err(io_error)?;
            match load_record(&table, &key)? {
                Some(mut record) => {
                    let outcome = update(&mut record);
                    store_record(&mut table, &key, &record)?;
                    Some(outcome)
                },
                None => None,
            }
        };

        if outcome.is_some() {
            txn.commit().map_err(io_error)?;
        } else {
            txn.abort().map_err(io_error)?;
        }
        Ok(outcome)
    }
}

impl SecretStore for RedbStorage {
    fn load_secrets(&self) -> Result<Vec<RotatingSecret>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(SECRETS).map_err(io_error)?;

        let mut secrets = Vec::new();
        for entry in table.iter().map_err(io_error)? {
            let (_, value) = entry.map_err(io_error)?;
            secrets.push(SecretRecord::decode(value.value())?.to_secret());
        }
        Ok(secrets)
    }

    fn add_secrets(&self, secrets: &[RotatingSecret]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table = txn.open_table(SECRETS).map_err(io_error)?;
            for secret in secrets {
                store_record(&mut table, &secret_key(&secret.id()), &SecretRecord::from(secret))?;
            }
        }
        txn.commit().map_err(io_error)?;
        Ok(())
    }

    fn remove_secrets(&self, ids: &[SecretId]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table = txn.open_table(SECRETS).map_err(io_error)?;
            for id in ids {
                table.remove(secret_key(id).as_slice()).map_err(io_error)?;
            }
        }
        txn.commit().map_err(io_error)?;
        Ok(())
    }

    fn remove_contact(&self, contact: ContactId) -> Result<(), StorageError> {
        let removed = self.remove_matching(|key| key_contact(key) == Some(contact.0))?;
        tracing::debug!(contact = %contact, removed, "removed contact secrets");
        Ok(())
    }

    fn load_transport_latencies(&self) -> Result<BTreeMap<TransportId, Duration>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(TRANSPORTS).map_err(io_error)?;

        let mut latencies = BTreeMap::new();
        for entry in table.iter().map_err(io_error)? {
            let (name, millis) = entry.map_err(io_error)?;
            latencies.insert(TransportId::new(name.value()), Duration::from_millis(millis.value()));
        }
        Ok(latencies)
    }

    fn set_transport_latency(
        &self,
        transport: &TransportId,
        max_latency: Duration,
    ) -> Result<(), StorageError> {
        let millis = u64::try_from(max_latency.as_millis()).unwrap_or(u64::MAX);

        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table = txn.open_table(TRANSPORTS).map_err(io_error)?;
            table.insert(transport.as_str(), millis).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;
        Ok(())
    }

    fn remove_transport(&self, transport: &TransportId) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table = txn.open_table(TRANSPORTS).map_err(io_error)?;
            table.remove(transport.as_str()).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        let name = transport.as_str().as_bytes();
        let removed = self.remove_matching(|key| key_transport(key) == Some(name))?;
        tracing::debug!(transport = %transport, removed, "removed transport secrets");
        Ok(())
    }

    fn set_reordering_window(
        &self,
        id: &SecretId,
        window: WindowState,
    ) -> Result<(), StorageError> {
        self.update_record(id, |record| {
            record.window = window;
        })?
        .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    fn increment_stream_counter(&self, id: &SecretId) -> Result<Option<u64>, StorageError> {
        self.update_record(id, |record| {
            let stream_number = record.outgoing;
            record.outgoing = stream_number.saturating_add(1);
            stream_number
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn secret(contact: u64, transport: &str, period: u64) -> RotatingSecret {
        let endpoint = Endpoint {
            contact: ContactId(contact),
            transport: TransportId::new(transport),
            epoch: 1_000,
            alice: contact % 2 == 0,
        };
        RotatingSecret::new(endpoint, period, SecretBytes::new([period as u8; SECRET_LENGTH]))
    }

    #[test]
    fn test_secret_key_layout() {
        let id = secret(0x0102, "tcp", 7).id();
        let key = secret_key(&id);

        assert_eq!(key.len(), 16 + 3);
        assert_eq!(key_contact(&key), Some(0x0102));
        assert_eq!(&key[8..16], &7u64.to_be_bytes());
        assert_eq!(key_transport(&key), Some(b"tcp".as_slice()));
    }

    #[test]
    fn test_add_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let mut original = secret(1, "tcp", 3);
        original.window = WindowState { centre: 9, bitmap: [0xF0, 0, 0, 1] };
        original.outgoing = 42;
        storage.add_secrets(std::slice::from_ref(&original)).unwrap();

        let loaded = storage.load_secrets().unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[test]
    fn test_add_replaces_existing() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let mut s = secret(1, "tcp", 3);
        storage.add_secrets(std::slice::from_ref(&s)).unwrap();
        s.outgoing = 5;
        storage.add_secrets(std::slice::from_ref(&s)).unwrap();

        let loaded = storage.load_secrets().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].outgoing, 5);
    }

    #[test]
    fn test_increment_stream_counter() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let s = secret(1, "tcp", 3);
        storage.add_secrets(std::slice::from_ref(&s)).unwrap();

        assert_eq!(storage.increment_stream_counter(&s.id()).unwrap(), Some(0));
        assert_eq!(storage.increment_stream_counter(&s.id()).unwrap(), Some(1));
        assert_eq!(storage.increment_stream_counter(&secret(2, "tcp", 3).id()).unwrap(), None);
    }

    #[test]
    fn test_set_reordering_window_requires_secret() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let s = secret(1, "tcp", 3);

        let window = WindowState { centre: 1, bitmap: [0x80, 0, 0, 0] };
        assert!(matches!(
            storage.set_reordering_window(&s.id(), window),
            Err(StorageError::NotFound(_))
        ));

        storage.add_secrets(std::slice::from_ref(&s)).unwrap();
        storage.set_reordering_window(&s.id(), window).unwrap();
        assert_eq!(storage.load_secrets().unwrap()[0].window, window);
    }

    #[test]
    fn test_remove_contact_and_transport() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        storage
            .add_secrets(&[
                secret(1, "tcp", 1),
                secret(1, "bt", 1),
                secret(2, "tcp", 1),
                secret(2, "tcp-old", 1),
            ])
            .unwrap();
        storage.set_transport_latency(&TransportId::new("tcp"), Duration::from_secs(60)).unwrap();

        storage.remove_contact(ContactId(1)).unwrap();
        assert_eq!(storage.load_secrets().unwrap().len(), 2);

        storage.remove_transport(&TransportId::new("tcp")).unwrap();
        let remaining = storage.load_secrets().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].endpoint.transport.as_str(), "tcp-old");
        assert!(storage.load_transport_latencies().unwrap().is_empty());
    }

    #[test]
    fn test_remove_secrets_ignores_missing() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let s = secret(1, "tcp", 1);
        storage.add_secrets(std::slice::from_ref(&s)).unwrap();

        storage.remove_secrets(&[s.id(), secret(9, "tcp", 9).id()]).unwrap();
        assert!(storage.load_secrets().unwrap().is_empty());
    }
}
