//! Two peers sharing an endpoint: outgoing contexts, tag recognition,
//! rotation over time and recovery from storage failures.

use std::{
    collections::BTreeMap,
    io::{Cursor, Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use tagwire_core::{
    ChaoticStorage, ConnectionContext, ContactId, Endpoint, KeyManager, KeyManagerConfig,
    KeyManagerError, KeyManagerEvent, ManualClock, ManualScheduler, MemoryStorage, Role,
    RotatingSecret, SecretId, SecretStore, StorageError, TransportId, WindowState,
    create_secured_reader, create_secured_writer,
};
use tagwire_crypto::{SECRET_LENGTH, SecretBytes, Tag};
use tagwire_proto::TAG_LENGTH;

const EPOCH: u64 = 1_700_000_000_000;
const ROTATION: Duration = Duration::from_secs(120);

type Manager<S> = KeyManager<ManualClock, S, ManualScheduler>;

struct Peer<S: SecretStore> {
    manager: Arc<Manager<S>>,
    storage: S,
    scheduler: ManualScheduler,
    remote: ContactId,
}

fn tcp() -> TransportId {
    TransportId::new("tcp")
}

fn shared_secret() -> SecretBytes {
    SecretBytes::new([0x5A; SECRET_LENGTH])
}

/// Rotation length equals the transport latency: no skew allowance.
fn config() -> KeyManagerConfig {
    KeyManagerConfig { max_clock_skew: Duration::ZERO, ..KeyManagerConfig::default() }
}

fn peer<S: SecretStore>(clock: &ManualClock, storage: S, remote: u64, alice: bool) -> Peer<S> {
    let scheduler = ManualScheduler::new();
    let manager =
        Arc::new(KeyManager::new(clock.clone(), storage.clone(), scheduler.clone(), config()));
    manager.transport_added(tcp(), ROTATION).unwrap();
    manager.start().unwrap();

    let endpoint = Endpoint { contact: ContactId(remote), transport: tcp(), epoch: EPOCH, alice };
    manager.endpoint_added(endpoint, shared_secret()).unwrap();

    Peer { manager, storage, scheduler, remote: ContactId(remote) }
}

fn pair(clock: &ManualClock) -> (Peer<MemoryStorage>, Peer<MemoryStorage>) {
    (peer(clock, MemoryStorage::new(), 2, true), peer(clock, MemoryStorage::new(), 1, false))
}

/// Memory storage whose `add_secrets` fails with a chosen error.
#[derive(Clone, Default)]
struct FailingAdds {
    inner: MemoryStorage,
    failure: Arc<Mutex<Option<StorageError>>>,
}

impl FailingAdds {
    fn fail_with(&self, error: Option<StorageError>) {
        *self.failure.lock().unwrap() = error;
    }
}

impl SecretStore for FailingAdds {
    fn load_secrets(&self) -> Result<Vec<RotatingSecret>, StorageError> {
        self.inner.load_secrets()
    }

    fn add_secrets(&self, secrets: &[RotatingSecret]) -> Result<(), StorageError> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.inner.add_secrets(secrets)
    }

    fn remove_secrets(&self, ids: &[SecretId]) -> Result<(), StorageError> {
        self.inner.remove_secrets(ids)
    }

    fn remove_contact(&self, contact: ContactId) -> Result<(), StorageError> {
        self.inner.remove_contact(contact)
    }

    fn load_transport_latencies(&self) -> Result<BTreeMap<TransportId, Duration>, StorageError> {
        self.inner.load_transport_latencies()
    }

    fn set_transport_latency(
        &self,
        transport: &TransportId,
        max_latency: Duration,
    ) -> Result<(), StorageError> {
        self.inner.set_transport_latency(transport, max_latency)
    }

    fn remove_transport(&self, transport: &TransportId) -> Result<(), StorageError> {
        self.inner.remove_transport(transport)
    }

    fn set_reordering_window(
        &self,
        id: &SecretId,
        window: WindowState,
    ) -> Result<(), StorageError> {
        self.inner.set_reordering_window(id, window)
    }

    fn increment_stream_counter(&self, id: &SecretId) -> Result<Option<u64>, StorageError> {
        self.inner.increment_stream_counter(id)
    }
}

fn disk_full() -> Option<StorageError> {
    Some(StorageError::Io("disk full".to_string()))
}

fn bob_secret(period: u64) -> SecretId {
    Endpoint { contact: ContactId(1), transport: tcp(), epoch: EPOCH, alice: false }
        .secret_id(period)
}

fn connect<S: SecretStore>(peer: &Peer<S>) -> ConnectionContext {
    peer.manager.get_connection_context(peer.remote, &tcp()).unwrap().unwrap()
}

/// Write `message` as the initiator and return the raw bytes on the wire.
fn send(ctx: &ConnectionContext, message: &[u8]) -> Vec<u8> {
    let mut writer = create_secured_writer(Vec::new(), ctx);
    writer.write_all(message).unwrap();
    writer.close().unwrap();
    writer.into_inner()
}

fn split_tag(wire: &[u8]) -> (Tag, &[u8]) {
    let mut tag = [0u8; TAG_LENGTH];
    tag.copy_from_slice(&wire[..TAG_LENGTH]);
    (Tag::from_bytes(tag), &wire[TAG_LENGTH..])
}

#[test]
fn initiator_and_responder_exchange_messages() {
    let clock = ManualClock::new(EPOCH + 130_000);
    let (alice, bob) = pair(&clock);

    let outgoing = connect(&alice);
    assert_eq!(outgoing.period, 2);
    assert_eq!(outgoing.role, Role::Initiator);

    let wire = send(&outgoing, b"hello bob");
    let (tag, frames) = split_tag(&wire);

    let incoming = bob.manager.accept_connection(&tcp(), &tag).unwrap().unwrap();
    assert_eq!(incoming.contact, ContactId(1));
    assert_eq!(incoming.period, 2);
    assert_eq!(incoming.stream_number, outgoing.stream_number);
    assert_eq!(incoming.alice, outgoing.alice);
    assert_eq!(incoming.role, Role::Responder);

    let mut received = Vec::new();
    create_secured_reader(Cursor::new(frames), &incoming).read_to_end(&mut received).unwrap();
    assert_eq!(received, b"hello bob");

    // The responder answers without a tag on the reverse direction
    let mut reply = create_secured_writer(Vec::new(), &incoming);
    reply.write_all(b"hello alice").unwrap();
    reply.close().unwrap();
    let reply = reply.into_inner();

    let mut answer = Vec::new();
    create_secured_reader(Cursor::new(reply), &outgoing).read_to_end(&mut answer).unwrap();
    assert_eq!(answer, b"hello alice");

    // The tag is consumed
    assert!(bob.manager.accept_connection(&tcp(), &tag).unwrap().is_none());
}

#[test]
fn directions_use_distinct_keys() {
    let clock = ManualClock::new(EPOCH);
    let (alice, bob) = pair(&clock);

    let outgoing = connect(&alice);
    let wire = send(&outgoing, b"ping");
    let (tag, frames) = split_tag(&wire);
    bob.manager.accept_connection(&tcp(), &tag).unwrap().unwrap();

    // Reflecting the initiator's own frames back at it must fail
    let mut out = Vec::new();
    assert!(create_secured_reader(Cursor::new(frames), &outgoing).read_to_end(&mut out).is_err());
}

#[test]
fn both_sides_can_initiate() {
    let clock = ManualClock::new(EPOCH + 10_000);
    let (alice, bob) = pair(&clock);

    let from_bob = connect(&bob);
    assert!(!from_bob.alice);
    let wire = send(&from_bob, b"from bob");
    let (tag, frames) = split_tag(&wire);

    let incoming = alice.manager.accept_connection(&tcp(), &tag).unwrap().unwrap();
    assert!(!incoming.alice);
    let mut received = Vec::new();
    create_secured_reader(Cursor::new(frames), &incoming).read_to_end(&mut received).unwrap();
    assert_eq!(received, b"from bob");
}

#[test]
fn current_period_after_130_seconds() {
    let clock = ManualClock::new(EPOCH);
    let (alice, _bob) = pair(&clock);

    clock.advance(Duration::from_secs(130));
    alice.scheduler.tick();

    // (t - E) / 120 + 1 = 2
    assert_eq!(connect(&alice).period, 2);
    assert_eq!(alice.manager.live_periods(ContactId(2), &tcp()), vec![1, 2, 3]);
}

#[test]
fn dead_period_tags_stop_being_recognised() {
    let clock = ManualClock::new(EPOCH);
    let (alice, bob) = pair(&clock);

    let first = connect(&alice);
    let second = connect(&alice);
    assert_eq!((first.period, first.stream_number), (1, 0));
    assert_eq!((second.period, second.stream_number), (1, 1));

    let (tag, _) = split_tag(&send(&first, b"early"));
    assert!(bob.manager.accept_connection(&tcp(), &tag).unwrap().is_some());

    clock.advance(Duration::from_secs(600));
    bob.scheduler.tick();

    let (late_tag, _) = split_tag(&send(&second, b"late"));
    assert!(bob.manager.accept_connection(&tcp(), &late_tag).unwrap().is_none());

    let bob_endpoint = Endpoint { contact: ContactId(1), transport: tcp(), epoch: EPOCH, alice: false };
    assert!(bob.storage.secret(&bob_endpoint.secret_id(1)).is_none());
    assert_eq!(bob.manager.live_periods(ContactId(1), &tcp()), vec![5, 6, 7]);
}

#[test]
fn old_period_still_accepted_after_rotation() {
    let clock = ManualClock::new(EPOCH + 100_000);
    let (alice, bob) = pair(&clock);

    // Alice's clock lags: she still uses period 1 after bob rotated
    let ctx = connect(&alice);
    assert_eq!(ctx.period, 1);

    clock.advance(Duration::from_secs(30));
    bob.scheduler.tick();

    let (tag, _) = split_tag(&send(&ctx, b"old"));
    let incoming = bob.manager.accept_connection(&tcp(), &tag).unwrap().unwrap();
    assert_eq!(incoming.period, 1);
}

#[test]
fn restart_resumes_counters_and_windows() {
    let clock = ManualClock::new(EPOCH);
    let (alice, bob) = pair(&clock);

    let first = connect(&alice);
    let (tag, _) = split_tag(&send(&first, b"before restart"));
    bob.manager.accept_connection(&tcp(), &tag).unwrap().unwrap();

    alice.manager.stop();
    bob.manager.stop();
    assert_eq!(bob.manager.recognizer().secret_count(), 0);

    let restarted_alice = Arc::new(KeyManager::new(
        clock.clone(),
        alice.storage.clone(),
        ManualScheduler::new(),
        config(),
    ));
    let restarted_bob = Arc::new(KeyManager::new(
        clock.clone(),
        bob.storage.clone(),
        ManualScheduler::new(),
        config(),
    ));
    restarted_alice.start().unwrap();
    restarted_bob.start().unwrap();

    // Consumed tag stays consumed
    assert!(restarted_bob.accept_connection(&tcp(), &tag).unwrap().is_none());

    // Stream counter continues
    let next = restarted_alice.get_connection_context(ContactId(2), &tcp()).unwrap().unwrap();
    assert_eq!(next.stream_number, 1);
    let (tag, _) = split_tag(&send(&next, b"after restart"));
    assert!(restarted_bob.accept_connection(&tcp(), &tag).unwrap().is_some());
}

#[test]
fn start_after_downtime_fast_forwards() {
    let clock = ManualClock::new(EPOCH);
    let (alice, _bob) = pair(&clock);
    alice.manager.stop();

    clock.advance(Duration::from_secs(3_600));
    let restarted = Arc::new(KeyManager::new(
        clock.clone(),
        alice.storage.clone(),
        ManualScheduler::new(),
        config(),
    ));
    restarted.start().unwrap();

    // (3600 / 120) + 1 = 31
    assert_eq!(restarted.live_periods(ContactId(2), &tcp()), vec![30, 31, 32]);
    assert_eq!(alice.storage.secret_count(), 3);
}

#[test]
fn storage_failures_are_retried_next_cycle() {
    let clock = ManualClock::new(EPOCH);
    let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
    let bob = peer(&clock, storage.clone(), 1, false);
    let (alice, _) = pair(&clock);

    storage.set_failure_rate(1.0);
    clock.advance(ROTATION);
    let err = bob.manager.run().unwrap_err();
    assert!(matches!(err, KeyManagerError::Storage(_)));
    assert!(!err.is_fatal());
    assert!(!bob.manager.is_halted());

    // Period 3 is live in memory but not yet persisted
    let period_three = Endpoint { contact: ContactId(1), transport: tcp(), epoch: EPOCH, alice: false }
        .secret_id(3);
    assert!(storage.inner().secret(&period_three).is_none());

    storage.set_failure_rate(0.0);
    bob.scheduler.tick();
    assert!(storage.inner().secret(&period_three).is_some());

    let ctx = connect(&alice);
    assert_eq!(ctx.period, 2);
    let (tag, _) = split_tag(&send(&ctx, b"recovered"));
    assert!(bob.manager.accept_connection(&tcp(), &tag).unwrap().is_some());
}

#[test]
fn failed_start_keeps_the_stored_chain() {
    let clock = ManualClock::new(EPOCH);
    let storage = FailingAdds::default();
    let bob = peer(&clock, storage.clone(), 1, false);
    bob.manager.stop();
    drop(bob);

    clock.advance(ROTATION * 4);
    storage.fail_with(disk_full());
    let restarted =
        Arc::new(KeyManager::new(clock.clone(), storage.clone(), ManualScheduler::new(), config()));
    assert!(matches!(restarted.start(), Err(KeyManagerError::Storage(_))));
    assert!(!restarted.is_running());

    // Nothing was removed, so the chain head is still on disk
    assert_eq!(storage.inner.secret_count(), 3);
    assert!(storage.inner.secret(&bob_secret(2)).is_some());

    storage.fail_with(None);
    restarted.start().unwrap();
    assert_eq!(restarted.live_periods(ContactId(1), &tcp()), vec![4, 5, 6]);
    assert_eq!(storage.inner.secret_count(), 3);
    assert!(storage.inner.secret(&bob_secret(2)).is_none());

    let (alice, _) = pair(&clock);
    let ctx = connect(&alice);
    let (tag, _) = split_tag(&send(&ctx, b"after recovery"));
    let incoming = restarted.accept_connection(&tcp(), &tag).unwrap().unwrap();
    assert_eq!(incoming.period, 5);
    assert!(restarted.get_connection_context(ContactId(1), &tcp()).unwrap().is_some());
}

#[test]
fn dead_secrets_stay_stored_until_replacements_persist() {
    let clock = ManualClock::new(EPOCH);
    let storage = FailingAdds::default();
    let bob = peer(&clock, storage.clone(), 1, false);

    storage.fail_with(disk_full());
    clock.advance(ROTATION * 2);
    assert!(bob.manager.run().is_err());
    assert_eq!(bob.manager.live_periods(ContactId(1), &tcp()), vec![2, 3, 4]);
    assert!(storage.inner.secret(&bob_secret(0)).is_some());
    assert!(storage.inner.secret(&bob_secret(1)).is_some());
    assert!(storage.inner.secret(&bob_secret(3)).is_none());

    storage.fail_with(None);
    bob.manager.run().unwrap();
    assert!(storage.inner.secret(&bob_secret(0)).is_none());
    assert!(storage.inner.secret(&bob_secret(1)).is_none());
    assert!(storage.inner.secret(&bob_secret(4)).is_some());
    assert_eq!(storage.inner.secret_count(), 3);
}

#[test]
fn permanent_storage_error_halts_rotation() {
    let clock = ManualClock::new(EPOCH);
    let storage = FailingAdds::default();
    let bob = peer(&clock, storage.clone(), 1, false);

    storage.fail_with(Some(StorageError::Serialization("record too large".to_string())));
    clock.advance(ROTATION);
    bob.scheduler.tick();

    assert!(bob.manager.is_halted());
    assert!(!bob.manager.is_running());
    assert_eq!(storage.inner.secret_count(), 3);
    assert!(storage.inner.secret(&bob_secret(0)).is_some());
}

#[test]
fn storage_failure_while_accepting_fails_closed() {
    let clock = ManualClock::new(EPOCH);
    let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
    let bob = peer(&clock, storage.clone(), 1, false);
    let (alice, _) = pair(&clock);

    let ctx = connect(&alice);
    let (tag, _) = split_tag(&send(&ctx, b"x"));

    storage.set_failure_rate(1.0);
    let err = bob.manager.accept_connection(&tcp(), &tag).unwrap_err();
    assert!(matches!(err, KeyManagerError::Recognizer(_)));
    assert!(!err.is_fatal());
}

#[test]
fn clock_going_backwards_halts_rotation() {
    let clock = ManualClock::new(EPOCH + 600_000);
    let (alice, _bob) = pair(&clock);

    clock.set(EPOCH + 100_000);
    alice.scheduler.tick();

    assert!(alice.manager.is_halted());
    assert!(!alice.manager.is_running());
    assert_eq!(alice.manager.recognizer().secret_count(), 0);
    assert!(alice.manager.get_connection_context(ContactId(2), &tcp()).unwrap().is_none());
}

#[test]
fn contact_removal_erases_everything() {
    let clock = ManualClock::new(EPOCH);
    let (alice, bob) = pair(&clock);
    let ctx = connect(&alice);

    bob.manager.handle_event(KeyManagerEvent::ContactRemoved(ContactId(1)));
    bob.scheduler.run_once_tasks();

    assert_eq!(bob.storage.secret_count(), 0);
    assert_eq!(bob.manager.recognizer().tag_count(), 0);
    let (tag, _) = split_tag(&send(&ctx, b"gone"));
    assert!(bob.manager.accept_connection(&tcp(), &tag).unwrap().is_none());
}

#[test]
fn transport_removal_scopes_secrets() {
    let clock = ManualClock::new(EPOCH);
    let (alice, _bob) = pair(&clock);

    alice
        .manager
        .apply_event(KeyManagerEvent::TransportRemoved(tcp()))
        .unwrap();

    assert_eq!(alice.manager.rotation_length(&tcp()), None);
    assert!(alice.manager.get_connection_context(ContactId(2), &tcp()).unwrap().is_none());
    assert!(alice.storage.load_transport_latencies().unwrap().is_empty());
    assert_eq!(alice.storage.secret_count(), 0);
}
