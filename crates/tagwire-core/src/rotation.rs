//! Rotation period geometry.
//!
//! Secrets rotate every `rotation_length`. Secret `p` is created two
//! periods before it becomes current and destroyed one period after it
//! stops being current:
//!
//! ```text
//!   created = epoch + L(p-2)
//!   │   new    │  current  │   old    │ dead ...
//!   ├──────────┼───────────┼──────────┤
//!            activated  deactivated  destroyed
//! ```
//!
//! At any time three generations are live, so a peer whose clock is up to
//! one period ahead or behind still finds a matching secret.

use std::{ops::RangeInclusive, time::Duration};

/// Lifecycle stage of a secret at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretPhase {
    /// Not yet created: the clock is before the secret's creation time
    Pending,
    /// Created, tags accepted from peers whose clocks run ahead
    New,
    /// Used for outgoing connections
    Current,
    /// Tags still accepted from peers whose clocks run behind
    Old,
    /// Must be erased
    Dead,
}

/// Rotation schedule of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSchedule {
    epoch: u64,
    rotation_length: u64,
}

impl RotationSchedule {
    /// Schedule anchored at `epoch` (ms since Unix epoch).
    ///
    /// A zero rotation length is treated as one millisecond.
    pub fn new(epoch: u64, rotation_length: Duration) -> Self {
        let rotation_length = (rotation_length.as_millis() as u64).max(1);
        Self { epoch, rotation_length }
    }

    /// Rotation length in milliseconds.
    pub fn rotation_length_millis(&self) -> u64 {
        self.rotation_length
    }

    /// Period that is current at `now`, or `None` if `now` is before the
    /// epoch (the clock went backwards).
    ///
    /// `current = floor((now - epoch) / rotation_length) + 1`
    pub fn current_period(&self, now: u64) -> Option<u64> {
        let elapsed = now.checked_sub(self.epoch)?;
        Some(elapsed / self.rotation_length + 1)
    }

    /// Old, current and new periods at `now`.
    pub fn live_periods(&self, now: u64) -> Option<RangeInclusive<u64>> {
        let current = self.current_period(now)?;
        Some(current.saturating_sub(1)..=current + 1)
    }

    /// Creation time of secret `period`, relative to the Unix epoch. May be
    /// negative for the first periods of an endpoint created near time 0.
    pub fn created_at(&self, period: u64) -> i128 {
        i128::from(self.epoch) + i128::from(self.rotation_length) * (i128::from(period) - 2)
    }

    /// Time at which secret `period` becomes current.
    pub fn activated_at(&self, period: u64) -> i128 {
        self.created_at(period) + i128::from(self.rotation_length)
    }

    /// Time at which secret `period` becomes old.
    pub fn deactivated_at(&self, period: u64) -> i128 {
        self.activated_at(period) + i128::from(self.rotation_length)
    }

    /// Time at which secret `period` must be erased.
    pub fn destroyed_at(&self, period: u64) -> i128 {
        self.deactivated_at(period) + i128::from(self.rotation_length)
    }

    /// Phase of secret `period` at `now`.
    pub fn phase(&self, period: u64, now: u64) -> SecretPhase {
        let now = i128::from(now);
        if now < self.created_at(period) {
            SecretPhase::Pending
        } else if now < self.activated_at(period) {
            SecretPhase::New
        } else if now < self.deactivated_at(period) {
            SecretPhase::Current
        } else if now < self.destroyed_at(period) {
            SecretPhase::Old
        } else {
            SecretPhase::Dead
        }
    }
}
