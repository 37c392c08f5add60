//! Tag recognition for incoming connections.
//!
//! For every live secret the recognizer precomputes the tag of each unseen
//! stream number in the secret's reordering window and indexes them. An
//! incoming connection's first [`TAG_LENGTH`](tagwire_crypto::TAG_LENGTH)
//! bytes are looked up in O(1); a hit consumes the tag, slides the window
//! and yields a [`ConnectionContext`].
//!
//! # Concurrency
//!
//! ```text
//!   recognize:  window_writes ──► state (consume, slide)  ──► release state
//!                     │                                          │
//!                     └────────── persist window ◄───────────────┘
//!   add/remove:                  state
//! ```
//!
//! Tag consumption happens entirely under the state lock, so two accept
//! threads racing on the same tag cannot both succeed. Window persistence
//! runs after the state lock is released but under `window_writes`, which
//! keeps writes for the same secret in the order the windows moved. Misses
//! take only the state lock.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tagwire_crypto::{SecretBytes, Tag, compute_tag, derive_tag_key};
use thiserror::Error;

use crate::{
    context::{ConnectionContext, Role},
    ids::{ContactId, SecretId, TransportId},
    secret::RotatingSecret,
    storage::{SecretStore, StorageError},
    window::{ReorderingWindow, WindowError, WindowState},
};

/// Errors from tag recognition
#[derive(Debug, Error)]
pub enum RecognizerError {
    /// Persisting an updated reordering window failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A tag of this secret is already indexed for another secret
    #[error("tag collision for secret {0}")]
    TagCollision(SecretId),

    /// An indexed stream number was rejected by its window
    #[error("reordering window invariant violated: {0}")]
    Window(#[from] WindowError),
}

impl RecognizerError {
    /// Returns true if this error is an invariant violation.
    ///
    /// Storage errors fail one connection attempt; everything else means
    /// key material may be reused and the process should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TagCollision(_) | Self::Window(_))
    }
}

struct TagEntry {
    secret: SecretId,
    stream_number: u32,
}

struct IncomingSecret {
    secret: SecretBytes,
    tag_key: SecretBytes,
    /// Alice flag of the peer, who initiates the streams we recognise
    alice: bool,
    window: ReorderingWindow,
}

#[derive(Default)]
struct RecognizerState {
    tags: HashMap<Tag, TagEntry>,
    secrets: HashMap<SecretId, IncomingSecret>,
}

impl RecognizerState {
    fn remove_secret(&mut self, id: &SecretId) -> bool {
        let Some(incoming) = self.secrets.remove(id) else {
            return false;
        };
        for stream_number in incoming.window.unseen() {
            let tag = compute_tag(&incoming.tag_key, stream_number);
            if self.tags.get(&tag).is_some_and(|entry| entry.secret == *id) {
                self.tags.remove(&tag);
            }
        }
        true
    }

    fn remove_where(&mut self, predicate: impl Fn(&SecretId) -> bool) -> usize {
        let ids: Vec<SecretId> = self.secrets.keys().filter(|id| predicate(id)).cloned().collect();
        for id in &ids {
            self.remove_secret(id);
        }
        ids.len()
    }
}

/// Index of expected tags across every live secret.
pub struct TagRecognizer<S: SecretStore> {
    store: S,
    state: Mutex<RecognizerState>,
    window_writes: Mutex<()>,
}

impl<S: SecretStore> TagRecognizer<S> {
    /// Empty recognizer persisting window updates to `store`.
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: Mutex::new(RecognizerState::default()),
            window_writes: Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecognizerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index the tags of every unseen stream number of `secret`.
    ///
    /// The recognizer keeps its own copy of the secret bytes. Re-adding a
    /// secret replaces the previous registration.
    ///
    /// # Errors
    ///
    /// - `TagCollision` if any tag is already indexed for another secret.
    ///   Nothing is added in that case.
    pub fn add_secret(&self, secret: &RotatingSecret) -> Result<(), RecognizerError> {
        let id = secret.id();
        let peer_alice = !secret.endpoint.alice;
        let tag_key = derive_tag_key(&secret.secret, peer_alice);
        let window = ReorderingWindow::from_state(secret.window);
        let tags: Vec<(Tag, u32)> =
            window.unseen().map(|n| (compute_tag(&tag_key, n), n)).collect();

        let mut state = self.state();
        state.remove_secret(&id);

        if tags.iter().any(|(tag, _)| state.tags.contains_key(tag)) {
            tracing::error!(secret = %id, "tag collision, secret not registered");
            return Err(RecognizerError::TagCollision(id));
        }

        for (tag, stream_number) in tags {
            state.tags.insert(tag, TagEntry { secret: id.clone(), stream_number });
        }
        tracing::debug!(secret = %id, centre = window.centre(), "secret registered");
        state.secrets.insert(
            id,
            IncomingSecret { secret: secret.secret.clone(), tag_key, alice: peer_alice, window },
        );

        Ok(())
    }

    /// Consume `tag` if it belongs to a live secret of `transport`.
    ///
    /// Returns `Ok(None)` for tags that are unknown or belong to another
    /// transport; that is the expected outcome for most traffic.
    ///
    /// # Errors
    ///
    /// - `Storage` if the updated window could not be persisted. The tag is
    ///   still consumed in memory, but no context is returned, so the
    ///   connection fails closed.
    /// - `TagCollision` if a tag entering the window is already indexed.
    pub fn recognize(
        &self,
        transport: &TransportId,
        tag: &Tag,
    ) -> Result<Option<ConnectionContext>, RecognizerError> {
        let candidate = self
            .state()
            .tags
            .get(tag)
            .is_some_and(|entry| entry.secret.transport == *transport);
        if !candidate {
            tracing::debug!(transport = %transport, "unrecognised tag");
            return Ok(None);
        }

        let _writes = self.window_writes.lock().unwrap_or_else(PoisonError::into_inner);

        let (context, id, window, collision) = {
            let mut guard = self.state();
            let RecognizerState { tags, secrets } = &mut *guard;

            // Re-check: another accept thread may have consumed the tag
            let Some(entry) = tags.remove(tag) else {
                return Ok(None);
            };
            let Some(incoming) = secrets.get_mut(&entry.secret) else {
                tracing::error!(secret = %entry.secret, "indexed tag without a secret");
                return Ok(None);
            };

            let change = incoming.window.set_seen(entry.stream_number)?;

            for stream_number in &change.removed {
                let expired = compute_tag(&incoming.tag_key, *stream_number);
                if tags.get(&expired).is_some_and(|e| e.secret == entry.secret) {
                    tags.remove(&expired);
                }
            }

            let mut collision = false;
            for stream_number in &change.added {
                let fresh = compute_tag(&incoming.tag_key, *stream_number);
                if tags.contains_key(&fresh) {
                    tracing::error!(
                        secret = %entry.secret,
                        stream_number = *stream_number,
                        "tag collision while sliding window"
                    );
                    collision = true;
                    continue;
                }
                tags.insert(
                    fresh,
                    TagEntry { secret: entry.secret.clone(), stream_number: *stream_number },
                );
            }

            let context = ConnectionContext {
                contact: entry.secret.contact,
                transport: entry.secret.transport.clone(),
                period: entry.secret.period,
                secret: incoming.secret.clone(),
                stream_number: entry.stream_number,
                alice: incoming.alice,
                role: Role::Responder,
            };
            (context, entry.secret, incoming.window.state(), collision)
        };

        if collision {
            return Err(RecognizerError::TagCollision(id));
        }

        if let Err(e) = self.store.set_reordering_window(&id, window) {
            tracing::warn!(secret = %id, error = %e, "failed to persist reordering window");
            return Err(e.into());
        }

        tracing::debug!(
            secret = %id,
            stream_number = context.stream_number,
            "tag recognised"
        );
        Ok(Some(context))
    }

    /// Remove one secret and all of its unconsumed tags.
    ///
    /// Returns false if the secret was not registered.
    pub fn remove_secret(&self, id: &SecretId) -> bool {
        self.state().remove_secret(id)
    }

    /// Remove every secret of `contact`. Returns the number removed.
    pub fn remove_contact(&self, contact: ContactId) -> usize {
        self.state().remove_where(|id| id.contact == contact)
    }

    /// Remove every secret scoped to `transport`. Returns the number
    /// removed.
    pub fn remove_transport(&self, transport: &TransportId) -> usize {
        self.state().remove_where(|id| id.transport == *transport)
    }

    /// Remove every secret.
    pub fn remove_all(&self) -> usize {
        self.state().remove_where(|_| true)
    }

    /// Number of indexed tags.
    pub fn tag_count(&self) -> usize {
        self.state().tags.len()
    }

    /// Number of registered secrets.
    pub fn secret_count(&self) -> usize {
        self.state().secrets.len()
    }

    /// Current window of a registered secret.
    pub fn window(&self, id: &SecretId) -> Option<WindowState> {
        self.state().secrets.get(id).map(|incoming| incoming.window.state())
    }
}

#[cfg(test)]
mod tests {
    use tagwire_crypto::SECRET_LENGTH;

    use super::*;
    use crate::{ids::Endpoint, storage::MemoryStorage};

    fn endpoint(contact: u64, transport: &str, alice: bool) -> Endpoint {
        Endpoint { contact: ContactId(contact), transport: TransportId::new(transport), epoch: 0, alice }
    }

    fn secret(contact: u64, transport: &str, period: u64) -> RotatingSecret {
        let mut bytes = [0u8; SECRET_LENGTH];
        bytes[0] = contact as u8;
        bytes[1] = period as u8;
        bytes[2] = transport.len() as u8;
        RotatingSecret::new(endpoint(contact, transport, true), period, SecretBytes::new(bytes))
    }

    /// Tag the peer (bob, since the local side is alice) sends for `n`.
    fn peer_tag(secret: &RotatingSecret, n: u32) -> Tag {
        compute_tag(&derive_tag_key(&secret.secret, false), n)
    }

    fn setup(secrets: &[RotatingSecret]) -> (MemoryStorage, TagRecognizer<MemoryStorage>) {
        let storage = MemoryStorage::new();
        storage.add_secrets(secrets).unwrap();
        let recognizer = TagRecognizer::new(storage.clone());
        for secret in secrets {
            recognizer.add_secret(secret).unwrap();
        }
        (storage, recognizer)
    }

    #[test]
    fn indexes_every_unseen_stream() {
        let s = secret(1, "tcp", 1);
        let (_, recognizer) = setup(&[s]);
        assert_eq!(recognizer.tag_count(), 16);
        assert_eq!(recognizer.secret_count(), 1);
    }

    #[test]
    fn recognises_peer_tag_once() {
        let s = secret(1, "tcp", 1);
        let (_, recognizer) = setup(&[s.clone()]);
        let tcp = TransportId::new("tcp");

        let context = recognizer.recognize(&tcp, &peer_tag(&s, 3)).unwrap().unwrap();
        assert_eq!(context.contact, ContactId(1));
        assert_eq!(context.period, 1);
        assert_eq!(context.stream_number, 3);
        assert!(!context.alice);
        assert_eq!(context.role, Role::Responder);
        assert_eq!(context.secret, s.secret);

        assert!(recognizer.recognize(&tcp, &peer_tag(&s, 3)).unwrap().is_none());
    }

    #[test]
    fn own_tags_are_not_recognised() {
        let s = secret(1, "tcp", 1);
        let (_, recognizer) = setup(&[s.clone()]);

        let own = compute_tag(&derive_tag_key(&s.secret, true), 0);
        assert!(recognizer.recognize(&TransportId::new("tcp"), &own).unwrap().is_none());
    }

    #[test]
    fn other_transport_is_a_miss_and_keeps_tag() {
        let s = secret(1, "tcp", 1);
        let (_, recognizer) = setup(&[s.clone()]);

        let tag = peer_tag(&s, 0);
        assert!(recognizer.recognize(&TransportId::new("bt"), &tag).unwrap().is_none());
        assert!(recognizer.recognize(&TransportId::new("tcp"), &tag).unwrap().is_some());
    }

    #[test]
    fn slide_registers_new_tags_and_persists_window() {
        let s = secret(1, "tcp", 1);
        let (storage, recognizer) = setup(&[s.clone()]);
        let tcp = TransportId::new("tcp");

        recognizer.recognize(&tcp, &peer_tag(&s, 15)).unwrap().unwrap();

        // Centre 16: window now covers 0..=31, 15 consumed
        assert_eq!(recognizer.tag_count(), 31);
        assert!(recognizer.recognize(&tcp, &peer_tag(&s, 31)).unwrap().is_some());

        let stored = storage.secret(&s.id()).unwrap();
        assert_eq!(stored.window, recognizer.window(&s.id()).unwrap());
        assert_eq!(stored.window.centre, 32);
    }

    #[test]
    fn expired_tags_are_retired() {
        let s = secret(1, "tcp", 1);
        let (_, recognizer) = setup(&[s.clone()]);
        let tcp = TransportId::new("tcp");

        recognizer.recognize(&tcp, &peer_tag(&s, 15)).unwrap().unwrap();
        recognizer.recognize(&tcp, &peer_tag(&s, 31)).unwrap().unwrap();

        // Centre 32: bottom is 16, so stream 0 has expired
        assert!(recognizer.recognize(&tcp, &peer_tag(&s, 0)).unwrap().is_none());
        assert!(recognizer.recognize(&tcp, &peer_tag(&s, 16)).unwrap().is_some());
    }

    #[test]
    fn storage_failure_fails_closed_but_consumes_tag() {
        let s = secret(1, "tcp", 1);
        let storage = MemoryStorage::new();
        // Secret deliberately not stored: window persistence reports NotFound
        let recognizer = TagRecognizer::new(storage);
        recognizer.add_secret(&s).unwrap();
        let tcp = TransportId::new("tcp");

        let result = recognizer.recognize(&tcp, &peer_tag(&s, 2));
        assert!(matches!(result, Err(RecognizerError::Storage(StorageError::NotFound(_)))));
        assert!(!result.unwrap_err().is_fatal());

        assert!(recognizer.recognize(&tcp, &peer_tag(&s, 2)).unwrap().is_none());
    }

    #[test]
    fn collision_rejects_whole_secret() {
        let s = secret(1, "tcp", 1);
        let (_, recognizer) = setup(&[s.clone()]);

        // Same secret bytes under another contact produce the same tags
        let mut twin = s.clone();
        twin.endpoint.contact = ContactId(2);
        let result = recognizer.add_secret(&twin);

        assert!(matches!(result, Err(RecognizerError::TagCollision(_))));
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(recognizer.secret_count(), 1);
        assert_eq!(recognizer.tag_count(), 16);
    }

    #[test]
    fn bulk_removal() {
        let secrets =
            [secret(1, "tcp", 1), secret(1, "bt", 1), secret(2, "tcp", 1), secret(2, "tcp", 2)];
        let (_, recognizer) = setup(&secrets);

        assert_eq!(recognizer.remove_contact(ContactId(1)), 2);
        assert_eq!(recognizer.remove_transport(&TransportId::new("tcp")), 2);
        assert_eq!(recognizer.secret_count(), 0);
        assert_eq!(recognizer.tag_count(), 0);
    }

    #[test]
    fn remove_secret_retires_tags() {
        let s = secret(1, "tcp", 1);
        let (_, recognizer) = setup(&[s.clone()]);

        assert!(recognizer.remove_secret(&s.id()));
        assert!(!recognizer.remove_secret(&s.id()));
        assert_eq!(recognizer.tag_count(), 0);
        assert!(recognizer.recognize(&TransportId::new("tcp"), &peer_tag(&s, 1)).unwrap().is_none());
    }
}
