//! Environment abstraction for deterministic testing.
//!
//! Decouples rotation logic from the system clock. Production code uses a
//! wall-clock implementation; tests drive a [`ManualClock`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Abstract environment providing wall-clock time.
///
/// Rotation periods are anchored to an endpoint's epoch, which both peers
/// agree on, so the clock must be wall-clock time rather than a process
/// local monotonic instant.
///
/// # Invariants
///
/// - `now_millis()` is expected never to go backwards past an endpoint's
///   epoch. The key manager treats that as a fatal invariant violation.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and hand
/// another to the key manager.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock starting at `millis`.
    pub fn new(millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(millis)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time, possibly backwards.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Environment for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
