//! Monotonic tick clock
//!
//! All accounting in the engine happens on a millisecond tick scale.  The
//! clock is a trait so tests can drive time by hand while production code
//! reads a monotonic instant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic milliseconds since some fixed origin
pub type Ticks = u64;

/// Ticks per second
pub const TICKS_PER_SEC: u64 = 1_000;

/// Source of monotonic ticks
pub trait Clock: Send + Sync {
    /// Current tick count
    fn now(&self) -> Ticks;
}

/// Wall clock backed by `Instant`
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock with its origin at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Ticks {
        self.origin.elapsed().as_millis() as Ticks
    }
}

/// Hand-driven clock for deterministic tests
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at the given tick
    pub fn starting_at(now: Ticks) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Advance the clock by `delta` ticks
    pub fn advance(&self, delta: Ticks) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute tick
    pub fn set(&self, now: Ticks) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_at(100);
        assert_eq!(clock.now(), 100);

        clock.advance(50);
        assert_eq!(clock.now(), 150);

        clock.set(1_000);
        assert_eq!(clock.now(), 1_000);
    }

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now();
        assert!(b >= a + 4, "clock went {} -> {}", a, b);
    }
}
