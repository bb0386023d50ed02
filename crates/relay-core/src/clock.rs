// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Monotonic-time source used by every timing-sensitive subsystem: the
//! streaming lifecycle controller's TTFB/silence budgets, the cooldown
//! ledger's deadlines, and the smart inter-request delay.
//!
//! Production code only ever constructs [`SystemClock`]; tests substitute a
//! [`FakeClock`] they can advance by hand so budget-expiry logic is
//! deterministic rather than racing real wall-clock sleeps.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Abstracts "now" so timing logic can be driven by a fake clock in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// A monotonic instant, used for all duration/elapsed arithmetic.
    fn now(&self) -> Instant;
    /// Wall-clock milliseconds since the Unix epoch, used for persisted
    /// cooldown deadlines (`unix_deadline_ms` in §3).
    fn unix_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A controllable clock for deterministic tests. `now()` and `unix_ms()`
/// both advance only when [`FakeClock::advance`] is called.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockState>>,
}

#[derive(Debug)]
struct FakeClockState {
    instant: Instant,
    unix_ms: u64,
}

impl FakeClock {
    pub fn new(start_unix_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockState {
                instant: Instant::now(),
                unix_ms: start_unix_ms,
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().unwrap();
        state.instant += by;
        state.unix_ms += by.as_millis() as u64;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap().instant
    }

    fn unix_ms(&self) -> u64 {
        self.inner.lock().unwrap().unix_ms
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_unix_ms_is_plausible() {
        let ms = SystemClock.unix_ms();
        assert!(ms > 1_700_000_000_000, "expected a post-2023 timestamp, got {ms}");
    }

    #[test]
    fn fake_clock_advances_both_instant_and_unix_ms() {
        let clock = FakeClock::new(1_000);
        let t0 = clock.now();
        assert_eq!(clock.unix_ms(), 1_000);
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.unix_ms(), 1_500);
        assert_eq!(clock.now() - t0, Duration::from_millis(500));
    }

    #[test]
    fn fake_clock_clones_share_state() {
        let clock = FakeClock::new(0);
        let clone = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(clone.unix_ms(), 1_000);
    }
}
