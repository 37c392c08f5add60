//! Rotating-secret key manager.
//!
//! Owns the secrets of every endpoint and keeps exactly the old, current
//! and new generation of each live:
//!
//! ```text
//!   period:   ... p-2 │ p-1   p   p+1 │ p+2 ...
//!                dead │ old  cur  new │ not yet derived
//! ```
//!
//! Secrets only ever move forward through the one-way ratchet. After a long
//! downtime the chain is fast-forwarded from the newest stored secret; a
//! stored secret newer than "new" means the clock went backwards, which is
//! fatal.
//!
//! # Concurrency
//!
//! Control-plane operations (start, stop, rotation, endpoint and lifecycle
//! events) are serialised by `control`. The `state` lock is held only for
//! in-memory bookkeeping; storage and recognizer calls happen after it is
//! released, so the rotation timer never blocks connection setup on
//! storage I/O and no two component locks are held at once.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tagwire_crypto::{SecretBytes, Tag, derive_next_secret};
use thiserror::Error;

use crate::{
    context::{ConnectionContext, Role},
    env::Environment,
    ids::{ContactId, Endpoint, SecretId, TransportId},
    recognizer::{RecognizerError, TagRecognizer},
    rotation::RotationSchedule,
    scheduler::{Scheduler, TaskHandle},
    secret::RotatingSecret,
    storage::{SecretStore, StorageError},
};

/// Key manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyManagerConfig {
    /// Largest clock difference tolerated between two peers
    pub max_clock_skew: Duration,
    /// How often rotation is re-evaluated
    pub rotation_check_interval: Duration,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            max_clock_skew: Duration::from_secs(24 * 60 * 60),
            rotation_check_interval: Duration::from_secs(60),
        }
    }
}

impl KeyManagerConfig {
    /// Rotation length of a transport: its maximum latency plus the
    /// tolerated clock skew.
    pub fn rotation_length(&self, max_latency: Duration) -> Duration {
        max_latency.saturating_add(self.max_clock_skew)
    }
}

/// Errors from key management
#[derive(Debug, Error)]
pub enum KeyManagerError {
    /// Secret storage failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Tag registration or recognition failed
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),

    /// The clock is before a point it has already passed
    #[error("clock went backwards for {contact}/{transport} at {now}")]
    ClockWentBackwards {
        /// Contact of the affected endpoint
        contact: ContactId,
        /// Transport of the affected endpoint
        transport: TransportId,
        /// Clock reading (ms since Unix epoch)
        now: u64,
    },

    /// `endpoint_added` for an endpoint that already has secrets
    #[error("endpoint already exists: {contact}/{transport}")]
    EndpointExists {
        /// Contact
        contact: ContactId,
        /// Transport
        transport: TransportId,
    },

    /// `endpoint_added` on a transport whose latency was never recorded
    #[error("unknown transport: {0}")]
    UnknownTransport(TransportId),
}

impl KeyManagerError {
    /// Returns true if this error is an invariant violation.
    ///
    /// Fatal errors halt the manager. Transient storage errors fail the
    /// operation in progress and are retried by the next rotation cycle; a
    /// permanent one (corrupt or unencodable record) would fail every cycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ClockWentBackwards { .. } => true,
            Self::Recognizer(e) => e.is_fatal(),
            Self::Storage(e) => !e.is_transient(),
            Self::EndpointExists { .. } | Self::UnknownTransport(_) => false,
        }
    }

    fn clock(endpoint: &Endpoint, now: u64) -> Self {
        Self::ClockWentBackwards {
            contact: endpoint.contact,
            transport: endpoint.transport.clone(),
            now,
        }
    }
}

/// Contact and transport lifecycle events, delivered by the event system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyManagerEvent {
    /// A contact was deleted
    ContactRemoved(ContactId),
    /// A transport became available
    TransportAdded {
        /// Transport
        transport: TransportId,
        /// Maximum latency of the transport
        max_latency: Duration,
    },
    /// A transport was removed
    TransportRemoved(TransportId),
}

type EndpointKey = (ContactId, TransportId);

struct EndpointKeys {
    endpoint: Endpoint,
    rotation_length: Duration,
    secrets: BTreeMap<u64, RotatingSecret>,
}

#[derive(Default)]
struct KeyState {
    rotation_lengths: HashMap<TransportId, Duration>,
    endpoints: BTreeMap<EndpointKey, EndpointKeys>,
    /// Secrets derived by rotation whose persistence failed
    unpersisted: BTreeSet<SecretId>,
    /// Dead secrets still in storage. Removed once every replacement is
    /// persisted, so storage always holds a chain head to resume from.
    undeleted: BTreeSet<SecretId>,
    task: Option<TaskHandle>,
}

#[derive(Default)]
struct RotationOutcome {
    created: Vec<RotatingSecret>,
    dead: Vec<SecretId>,
}

/// Bring one endpoint's secrets in line with the clock.
///
/// Missing live periods are derived forward from the newest secret, then
/// every secret older than "old" is erased. Periods below the newest
/// secret cannot be recovered and are left missing.
fn rotate(keys: &mut EndpointKeys, now: u64) -> Result<RotationOutcome, KeyManagerError> {
    let schedule = RotationSchedule::new(keys.endpoint.epoch, keys.rotation_length);
    let Some(live) = schedule.live_periods(now) else {
        return Err(KeyManagerError::clock(&keys.endpoint, now));
    };
    let (oldest, newest) = (*live.start(), *live.end());

    let mut outcome = RotationOutcome::default();
    let Some((&highest, latest)) = keys.secrets.last_key_value() else {
        return Ok(outcome);
    };
    if highest > newest {
        return Err(KeyManagerError::clock(&keys.endpoint, now));
    }

    let mut chain = latest.secret.clone();
    for period in (highest + 1)..=newest {
        chain = derive_next_secret(&chain, period);
        if period >= oldest {
            let secret = RotatingSecret::new(keys.endpoint.clone(), period, chain.clone());
            outcome.created.push(secret.clone());
            keys.secrets.insert(period, secret);
        }
    }

    let dead: Vec<u64> = keys.secrets.range(..oldest).map(|(period, _)| *period).collect();
    for period in dead {
        if let Some(mut secret) = keys.secrets.remove(&period) {
            outcome.dead.push(secret.id());
            secret.secret.erase();
        }
    }

    Ok(outcome)
}

/// Owner of every rotating secret in the process.
pub struct KeyManager<E: Environment, S: SecretStore, R: Scheduler> {
    env: E,
    store: S,
    scheduler: R,
    config: KeyManagerConfig,
    recognizer: Arc<TagRecognizer<S>>,
    control: Mutex<()>,
    state: Mutex<KeyState>,
    halted: AtomicBool,
}

impl<E: Environment, S: SecretStore, R: Scheduler> KeyManager<E, S, R> {
    /// Create a stopped key manager. Call [`start`](Self::start) to load
    /// persisted secrets and begin rotating.
    pub fn new(env: E, store: S, scheduler: R, config: KeyManagerConfig) -> Self {
        Self {
            recognizer: Arc::new(TagRecognizer::new(store.clone())),
            env,
            store,
            scheduler,
            config,
            control: Mutex::new(()),
            state: Mutex::new(KeyState::default()),
            halted: AtomicBool::new(false),
        }
    }

    fn control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recognizer fed by this manager.
    pub fn recognizer(&self) -> &Arc<TagRecognizer<S>> {
        &self.recognizer
    }

    /// Configuration in use.
    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    /// True between a successful [`start`](Self::start) and
    /// [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.state().task.is_some()
    }

    /// True once a background rotation hit a fatal error. A halted manager
    /// has dropped all key material and must not be restarted.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Rotation length of a known transport.
    pub fn rotation_length(&self, transport: &TransportId) -> Option<Duration> {
        self.state().rotation_lengths.get(transport).copied()
    }

    /// Periods currently held for an endpoint, ascending.
    pub fn live_periods(&self, contact: ContactId, transport: &TransportId) -> Vec<u64> {
        self.state()
            .endpoints
            .get(&(contact, transport.clone()))
            .map(|keys| keys.secrets.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Load persisted secrets, replace dead ones, register the live ones
    /// and schedule periodic rotation.
    ///
    /// Starting a running manager is a no-op.
    ///
    /// # Errors
    ///
    /// Any error leaves the manager stopped. The caller should treat it as
    /// fatal for startup.
    pub fn start(self: &Arc<Self>) -> Result<(), KeyManagerError> {
        let _control = self.control();
        if self.is_running() {
            tracing::warn!("key manager already running");
            return Ok(());
        }

        let latencies = self.store.load_transport_latencies()?;
        let stored = self.store.load_secrets()?;
        let now = self.env.now_millis();

        let rotation_lengths: HashMap<TransportId, Duration> = latencies
            .into_iter()
            .map(|(transport, latency)| (transport, self.config.rotation_length(latency)))
            .collect();

        let mut endpoints: BTreeMap<EndpointKey, EndpointKeys> = BTreeMap::new();
        for secret in stored {
            let Some(&rotation_length) = rotation_lengths.get(&secret.endpoint.transport) else {
                tracing::warn!(secret = %secret.id(), "transport has no known latency, secret skipped");
                continue;
            };
            let key = (secret.endpoint.contact, secret.endpoint.transport.clone());
            let keys = endpoints.entry(key).or_insert_with(|| EndpointKeys {
                endpoint: secret.endpoint.clone(),
                rotation_length,
                secrets: BTreeMap::new(),
            });
            keys.secrets.insert(secret.period, secret);
        }

        let mut outcome = RotationOutcome::default();
        for keys in endpoints.values_mut() {
            let RotationOutcome { created, dead } = rotate(keys, now)?;
            outcome.created.extend(created);
            outcome.dead.extend(dead);
        }

        if !outcome.created.is_empty() {
            self.store.add_secrets(&outcome.created)?;
        }
        let mut undeleted = BTreeSet::new();
        let removed =
            if outcome.dead.is_empty() { Ok(()) } else { self.store.remove_secrets(&outcome.dead) };
        if let Err(e) = removed {
            tracing::warn!(error = %e, count = outcome.dead.len(), "failed to remove dead secrets, will retry");
            undeleted.extend(outcome.dead.iter().cloned());
        }

        let mut registered = 0;
        for secret in endpoints.values().flat_map(|keys| keys.secrets.values()) {
            if let Err(e) = self.recognizer.add_secret(secret) {
                self.recognizer.remove_all();
                return Err(e.into());
            }
            registered += 1;
        }

        let weak = Arc::downgrade(self);
        let task = self.scheduler.schedule_at_fixed_rate(
            self.config.rotation_check_interval,
            Box::new(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.run_in_background();
                }
            }),
        );

        let endpoint_count = endpoints.len();
        {
            let mut state = self.state();
            state.rotation_lengths = rotation_lengths;
            state.endpoints = endpoints;
            state.unpersisted.clear();
            state.undeleted = undeleted;
            state.task = Some(task);
        }

        tracing::info!(
            endpoints = endpoint_count,
            secrets = registered,
            replaced = outcome.dead.len(),
            "key manager started"
        );
        Ok(())
    }

    /// Cancel rotation, unregister every secret and erase the manager's
    /// copies. Persisted secrets are kept for the next start.
    pub fn stop(&self) {
        let _control = self.control();
        self.stop_locked();
    }

    fn stop_locked(&self) {
        let (task, endpoints) = {
            let mut state = self.state();
            state.unpersisted.clear();
            state.undeleted.clear();
            (state.task.take(), std::mem::take(&mut state.endpoints))
        };

        if let Some(task) = task {
            task.cancel();
        }
        let unregistered = self.recognizer.remove_all();

        for mut keys in endpoints.into_values() {
            for secret in keys.secrets.values_mut() {
                secret.secret.erase();
            }
        }

        tracing::info!(unregistered, "key manager stopped");
    }

    /// Register a freshly paired endpoint.
    ///
    /// `initial_secret` is the endpoint's period-0 secret and is consumed.
    /// The chain is ratcheted forward to the periods live at the current
    /// time; intermediate secrets are erased as soon as the next one is
    /// derived. The rotation length comes from the transport's recorded
    /// latency, the same way [`start`](Self::start) derives it on reload.
    ///
    /// # Errors
    ///
    /// - `UnknownTransport` if [`transport_added`](Self::transport_added)
    ///   was never called for `endpoint.transport`
    /// - `ClockWentBackwards` if the clock is before `endpoint.epoch`
    /// - `EndpointExists` if the endpoint already has secrets
    /// - `Storage` if the secrets could not be persisted; nothing is
    ///   registered in that case
    pub fn endpoint_added(
        &self,
        endpoint: Endpoint,
        initial_secret: SecretBytes,
    ) -> Result<(), KeyManagerError> {
        let _control = self.control();
        let key = (endpoint.contact, endpoint.transport.clone());
        let rotation_length = {
            let state = self.state();
            if state.endpoints.contains_key(&key) {
                return Err(KeyManagerError::EndpointExists {
                    contact: endpoint.contact,
                    transport: endpoint.transport,
                });
            }
            let Some(&rotation_length) = state.rotation_lengths.get(&endpoint.transport) else {
                return Err(KeyManagerError::UnknownTransport(endpoint.transport));
            };
            rotation_length
        };

        let now = self.env.now_millis();
        let schedule = RotationSchedule::new(endpoint.epoch, rotation_length);
        let Some(live) = schedule.live_periods(now) else {
            return Err(KeyManagerError::clock(&endpoint, now));
        };
        let (oldest, newest) = (*live.start(), *live.end());

        let mut secrets = BTreeMap::new();
        let mut chain = initial_secret;
        for period in 0..=newest {
            if period >= oldest {
                secrets.insert(period, RotatingSecret::new(endpoint.clone(), period, chain.clone()));
            }
            if period < newest {
                chain = derive_next_secret(&chain, period + 1);
            }
        }
        chain.erase();

        let fresh: Vec<RotatingSecret> = secrets.values().cloned().collect();
        self.store.add_secrets(&fresh)?;

        for (i, secret) in fresh.iter().enumerate() {
            if let Err(e) = self.recognizer.add_secret(secret) {
                for registered in &fresh[..i] {
                    self.recognizer.remove_secret(&registered.id());
                }
                let ids: Vec<SecretId> = fresh.iter().map(RotatingSecret::id).collect();
                if let Err(cleanup) = self.store.remove_secrets(&ids) {
                    tracing::warn!(error = %cleanup, "failed to remove unregistered secrets");
                }
                return Err(e.into());
            }
        }

        tracing::info!(
            contact = %endpoint.contact,
            transport = %endpoint.transport,
            periods = ?secrets.keys().collect::<Vec<_>>(),
            "endpoint added"
        );
        self.state()
            .endpoints
            .insert(key, EndpointKeys { endpoint, rotation_length, secrets });
        Ok(())
    }

    /// Context for a new outgoing connection.
    ///
    /// Returns `Ok(None)` if the endpoint has no current secret (unknown
    /// contact, removed transport) or its stream counter is exhausted.
    ///
    /// # Errors
    ///
    /// - `Storage` if the stream counter could not be incremented
    /// - `ClockWentBackwards` if the clock is before the endpoint's epoch
    pub fn get_connection_context(
        &self,
        contact: ContactId,
        transport: &TransportId,
    ) -> Result<Option<ConnectionContext>, KeyManagerError> {
        let now = self.env.now_millis();
        let (id, secret, alice) = {
            let state = self.state();
            let Some(keys) = state.endpoints.get(&(contact, transport.clone())) else {
                return Ok(None);
            };
            let schedule = RotationSchedule::new(keys.endpoint.epoch, keys.rotation_length);
            let Some(current) = schedule.current_period(now) else {
                return Err(KeyManagerError::clock(&keys.endpoint, now));
            };
            let Some(secret) = keys.secrets.get(&current) else {
                tracing::debug!(contact = %contact, transport = %transport, current, "no current secret");
                return Ok(None);
            };
            (secret.id(), secret.secret.clone(), keys.endpoint.alice)
        };

        let Some(counter) = self.store.increment_stream_counter(&id)? else {
            return Ok(None);
        };
        let Ok(stream_number) = u32::try_from(counter) else {
            tracing::warn!(secret = %id, "outgoing stream counter exhausted");
            return Ok(None);
        };

        Ok(Some(ConnectionContext {
            contact,
            transport: transport.clone(),
            period: id.period,
            secret,
            stream_number,
            alice,
            role: Role::Initiator,
        }))
    }

    /// Resolve the tag of an incoming connection on `transport`.
    ///
    /// `Ok(None)` means the tag is not ours; close the connection silently.
    pub fn accept_connection(
        &self,
        transport: &TransportId,
        tag: &Tag,
    ) -> Result<Option<ConnectionContext>, KeyManagerError> {
        Ok(self.recognizer.recognize(transport, tag)?)
    }

    /// One rotation cycle: erase secrets that died, derive and register
    /// newly needed ones, and retry persisting secrets from earlier cycles.
    ///
    /// Dead secrets leave storage only after every derived secret has been
    /// persisted; until then they stay queued for removal.
    ///
    /// Every endpoint is processed even if one fails; the first error is
    /// returned.
    pub fn run(&self) -> Result<(), KeyManagerError> {
        let _control = self.control();
        let now = self.env.now_millis();

        let mut first_error: Option<KeyManagerError> = None;
        let mut outcome = RotationOutcome::default();
        let retry: Vec<RotatingSecret> = {
            let mut state = self.state();
            if state.task.is_none() {
                return Ok(());
            }
            let KeyState { endpoints, unpersisted, .. } = &mut *state;

            for keys in endpoints.values_mut() {
                match rotate(keys, now) {
                    Ok(RotationOutcome { created, dead }) => {
                        outcome.created.extend(created);
                        outcome.dead.extend(dead);
                    },
                    Err(e) => {
                        tracing::error!(contact = %keys.endpoint.contact, error = %e, "rotation failed");
                        first_error.get_or_insert(e);
                    },
                }
            }

            for id in &outcome.dead {
                unpersisted.remove(id);
            }
            unpersisted
                .iter()
                .filter_map(|id| {
                    endpoints
                        .get(&(id.contact, id.transport.clone()))
                        .and_then(|keys| keys.secrets.get(&id.period))
                        .cloned()
                })
                .collect()
        };

        for id in &outcome.dead {
            self.recognizer.remove_secret(id);
        }

        let mut to_persist = retry;
        to_persist.extend(outcome.created.iter().cloned());
        if !to_persist.is_empty() {
            let ids: Vec<SecretId> = to_persist.iter().map(RotatingSecret::id).collect();
            match self.store.add_secrets(&to_persist) {
                Ok(()) => {
                    let mut state = self.state();
                    for id in &ids {
                        state.unpersisted.remove(id);
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, count = ids.len(), "failed to persist secrets, will retry");
                    self.state().unpersisted.extend(ids);
                    first_error.get_or_insert(e.into());
                },
            }
        }

        let removable: Vec<SecretId> = {
            let mut state = self.state();
            state.undeleted.extend(outcome.dead.iter().cloned());
            if state.unpersisted.is_empty() {
                state.undeleted.iter().cloned().collect()
            } else {
                Vec::new()
            }
        };
        if !removable.is_empty() {
            match self.store.remove_secrets(&removable) {
                Ok(()) => {
                    let mut state = self.state();
                    for id in &removable {
                        state.undeleted.remove(id);
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, count = removable.len(), "failed to remove dead secrets, will retry");
                    first_error.get_or_insert(e.into());
                },
            }
        }

        for secret in &outcome.created {
            if let Err(e) = self.recognizer.add_secret(secret) {
                first_error.get_or_insert(e.into());
            }
        }

        tracing::debug!(
            created = outcome.created.len(),
            erased = outcome.dead.len(),
            "rotation cycle complete"
        );
        first_error.map_or(Ok(()), Err)
    }

    fn run_in_background(&self) {
        let Err(e) = self.run() else {
            return;
        };
        if e.is_fatal() {
            tracing::error!(error = %e, "fatal key management error, halting");
            self.halted.store(true, Ordering::SeqCst);
            self.stop();
        } else {
            tracing::warn!(error = %e, "rotation cycle failed, retrying next cycle");
        }
    }

    /// Erase and unregister every secret of `contact`.
    pub fn contact_removed(&self, contact: ContactId) -> Result<(), KeyManagerError> {
        let _control = self.control();
        let removed = {
            let mut state = self.state();
            let before = state.endpoints.len();
            state.endpoints.retain(|(c, _), _| *c != contact);
            state.unpersisted.retain(|id| id.contact != contact);
            state.undeleted.retain(|id| id.contact != contact);
            before - state.endpoints.len()
        };

        let unregistered = self.recognizer.remove_contact(contact);
        self.store.remove_contact(contact)?;

        tracing::info!(contact = %contact, endpoints = removed, unregistered, "contact removed");
        Ok(())
    }

    /// Record a transport's maximum latency.
    pub fn transport_added(
        &self,
        transport: TransportId,
        max_latency: Duration,
    ) -> Result<(), KeyManagerError> {
        let _control = self.control();
        self.store.set_transport_latency(&transport, max_latency)?;

        let rotation_length = self.config.rotation_length(max_latency);
        tracing::info!(transport = %transport, ?rotation_length, "transport added");
        self.state().rotation_lengths.insert(transport, rotation_length);
        Ok(())
    }

    /// Erase and unregister every secret scoped to `transport` and forget
    /// the transport.
    pub fn transport_removed(&self, transport: &TransportId) -> Result<(), KeyManagerError> {
        let _control = self.control();
        let removed = {
            let mut state = self.state();
            state.rotation_lengths.remove(transport);
            let before = state.endpoints.len();
            state.endpoints.retain(|(_, t), _| t != transport);
            state.unpersisted.retain(|id| id.transport != *transport);
            state.undeleted.retain(|id| id.transport != *transport);
            before - state.endpoints.len()
        };

        let unregistered = self.recognizer.remove_transport(transport);
        self.store.remove_transport(transport)?;

        tracing::info!(transport = %transport, endpoints = removed, unregistered, "transport removed");
        Ok(())
    }

    /// Apply a lifecycle event synchronously.
    pub fn apply_event(&self, event: KeyManagerEvent) -> Result<(), KeyManagerError> {
        match event {
            KeyManagerEvent::ContactRemoved(contact) => self.contact_removed(contact),
            KeyManagerEvent::TransportAdded { transport, max_latency } => {
                self.transport_added(transport, max_latency)
            },
            KeyManagerEvent::TransportRemoved(transport) => self.transport_removed(&transport),
        }
    }

    /// Queue a lifecycle event on the scheduler as a zero-delay job.
    pub fn handle_event(self: &Arc<Self>, event: KeyManagerEvent) -> TaskHandle {
        let weak = Arc::downgrade(self);
        self.scheduler.schedule_once(
            Duration::ZERO,
            Box::new(move || {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = manager.apply_event(event) {
                    tracing::warn!(error = %e, "failed to apply lifecycle event");
                }
            }),
        )
    }
}
