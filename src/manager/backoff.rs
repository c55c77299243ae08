//! Exponential backoff for reconnection workers.
//!
//! Delays start near 1.5 s, double on each failure, carry 10–20% random
//! jitter so a fleet of clients does not reconnect in lockstep, and cap
//! at 60 s.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Constants
// ============================================================================

/// First retry delay, before jitter.
const INITIAL_DELAY: Duration = Duration::from_millis(1500);

/// Upper bound for any produced delay.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Jitter factor range applied to every delay.
const JITTER_MIN: f64 = 1.10;
const JITTER_MAX: f64 = 1.20;

// ============================================================================
// Backoff
// ============================================================================

/// Jittered exponential backoff schedule.
///
/// Produced delays are non-decreasing and never exceed [`MAX_DELAY`].
#[derive(Debug)]
pub struct Backoff {
    /// Current base delay, doubled after every call.
    current: Duration,
    rng: StdRng,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Creates a schedule seeded from the OS.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Creates a deterministic schedule from a seed.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            current: INITIAL_DELAY,
            rng,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let jitter: f64 = self.rng.random_range(JITTER_MIN..=JITTER_MAX);
        let delay = self.current.mul_f64(jitter).min(MAX_DELAY);
        self.current = (self.current * 2).min(MAX_DELAY);
        delay
    }

    /// Resets the schedule to the initial delay.
    pub fn reset(&mut self) {
        self.current = INITIAL_DELAY;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_non_decreasing_and_capped() {
        let mut backoff = Backoff::from_seed(42);
        let mut prev = Duration::ZERO;

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= prev, "delay {delay:?} decreased below {prev:?}");
            assert!(delay <= MAX_DELAY);
            prev = delay;
        }

        // Well past the doubling horizon the schedule sits at the cap.
        assert_eq!(prev, MAX_DELAY);
    }

    #[test]
    fn test_delays_within_jitter_bounds() {
        let mut backoff = Backoff::from_seed(7);
        let first = backoff.next_delay();

        assert!(first >= INITIAL_DELAY.mul_f64(JITTER_MIN));
        assert!(first <= INITIAL_DELAY.mul_f64(JITTER_MAX));

        let second = backoff.next_delay();
        assert!(second >= (INITIAL_DELAY * 2).mul_f64(JITTER_MIN));
        assert!(second <= (INITIAL_DELAY * 2).mul_f64(JITTER_MAX));
    }

    #[test]
    fn test_different_seeds_differ_within_bounds() {
        let a: Vec<Duration> = {
            let mut b = Backoff::from_seed(1);
            (0..6).map(|_| b.next_delay()).collect()
        };
        let b: Vec<Duration> = {
            let mut b = Backoff::from_seed(2);
            (0..6).map(|_| b.next_delay()).collect()
        };

        assert_ne!(a, b, "jitter must depend on the seed");
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::from_seed(3);
        for _ in 0..10 {
            let _ = backoff.next_delay();
        }
        backoff.reset();

        let delay = backoff.next_delay();
        assert!(delay <= INITIAL_DELAY.mul_f64(JITTER_MAX));
    }
}
