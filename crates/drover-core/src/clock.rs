//! Time and identifier minting.
//!
//! Components that reason about elapsed time (orphan recovery, alert
//! windows, runner leases) take a [`Clock`] so tests can drive time
//! deterministically.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock with a settable instant. Clones share the instant.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    fn with_lock<T>(&self, f: impl FnOnce(&mut DateTime<Utc>) -> T) -> T {
        match self.now.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.with_lock(|now| *now = *now + delta);
    }

    /// Alias usable from async tests; the lock is never held across awaits.
    pub async fn advance_async(&self, delta: Duration) {
        self.advance(delta);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.with_lock(|now| *now = instant);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.with_lock(|now| *now)
    }
}

/// Mint a task identifier: `task_` + 16 hex chars (8 random bytes from the
/// thread-local CSPRNG).
pub fn mint_task_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 8];
    rand::rng().fill(&mut bytes);
    format!("task_{}", hex::encode(bytes))
}

/// Mint a usage event identifier.
pub fn mint_event_id() -> String {
    format!("evt_{}", uuid::Uuid::new_v4().simple())
}
