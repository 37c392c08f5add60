//! Production environment backed by the system clock.
//!
//! The key manager anchors rotation periods to wall-clock time shared with
//! the peer, so this reads `SystemTime`, not a monotonic clock. A clock set
//! before 1970 reads as 0, which the key manager reports as the clock going
//! backwards.

use std::time::{SystemTime, UNIX_EPOCH};

use tagwire_core::Environment;

/// Production environment using the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}
