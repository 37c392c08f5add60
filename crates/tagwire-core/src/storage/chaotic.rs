//! Chaotic storage wrapper for fault injection testing
//!
//! Randomly fails operations so tests can check that storage errors reach
//! the caller and that rotation retries on its next cycle.

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

/// Secret store wrapper that randomly injects failures
///
/// Delegates to an underlying store but fails operations with
/// `StorageError::Io` at a configured rate. Failure rate and RNG state are
/// shared between clones, so a test can flip the rate on its handle while
/// the system under test holds another.
#[derive(Clone)]
pub struct ChaoticStorage<S: SecretStore> {
    inner: S,
    chaos: Arc<Mutex<Chaos>>,
}

/// Deterministic failure source.
///
/// Linear congruential generator, so runs are reproducible with the same
/// seed.
struct Chaos {
    state: u64,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// Operations attempted
    operations: usize,
    /// Operations failed
    failures: usize,
}

impl Chaos {
    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    fn should_fail(&mut self) -> bool {
        self.operations += 1;
        let fail = self.next() < self.failure_rate;
        if fail {
            self.failures += 1;
        }
        fail
    }
}

impl<S: SecretStore> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            chaos: Arc::new(Mutex::new(Chaos {
                state: seed,
                failure_rate,
                operations: 0,
                failures: 0,
            })),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Change the failure rate for every clone of this wrapper.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0] or the mutex is
    /// poisoned
    #[allow(clippy::expect_used)]
    pub fn set_failure_rate(&self, failure_rate: f64) {
        assert!((0.0..=1.0).contains(&failure_rate));
        self.chaos.lock().expect("Chaos mutex poisoned").failure_rate = failure_rate;
    }

    /// Total number of storage operations attempted.
    #[allow(clippy::expect_used)]
    pub fn operation_count(&self) -> usize {
        self.chaos.lock().expect("Chaos mutex poisoned").operations
    }

    /// Number of operations that were failed on purpose.
    #[allow(clippy::expect_used)]
    pub fn failure_count(&self) -> usize {
        self.chaos.lock().expect("Chaos mutex poisoned").failures
    }

    #[allow(clippy::expect_used)]
    fn inject(&self) -> Result<(), StorageError> {
        if self.chaos.lock().expect("Chaos mutex poisoned").should_fail() {
            Err(StorageError::Io("chaotic failure injection".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<S: SecretStore> SecretStore for ChaoticStorage<S> {
    fn load_secrets(&self) -> Result<Vec<RotatingSecret>, StorageError> {
        self.inject()?;
        self.inner.load_secrets()
    }

    fn add_secrets(&self, secrets: &[RotatingSecret]) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.add_secrets(secrets)
    }

    fn remove_secrets(&self, ids: &[SecretId]) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.remove_secrets(ids)
    }

    fn remove_contact(&self, contact: ContactId) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.remove_contact(contact)
    }

    fn load_transport_latencies(&self) -> Result<BTreeMap<TransportId, Duration>, StorageError> {
        self.inject()?;
        self.inner.load_transport_latencies()
    }

    fn set_transport_latency(
        &self,
        transport: &TransportId,
        max_latency: Duration,
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.set_transport_latency(transport, max_latency)
    }

    fn remove_transport(&self, transport: &TransportId) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.remove_transport(transport)
    }

    fn set_reordering_window(
        &self,
        id: &SecretId,
        window: WindowState,
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.set_reordering_window(id, window)
    }

    fn increment_stream_counter(&self, id: &SecretId) -> Result<Option<u64>, StorageError> {
        self.inject()?;
        self.inner.increment_stream_counter(id)
    }
}
