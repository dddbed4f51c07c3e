//! # Backoff schedules
//!
//! Two schedules are used by the controller:
//!
//! - [`FibonacciBackoff`]: requeue delay for an object whose reconciliation failed
//! - [`ConflictBackoff`]: spacing of the local re-read-and-write attempts that
//!   follow an optimistic-concurrency conflict

use std::time::Duration;

/// Fibonacci requeue schedule
///
/// Sequence with the default bounds: 5s, 5s, 10s, 15s, 25s, 40s, 65s, ... capped at 300s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibonacciBackoff {
    /// Backoff for the first two errors, in seconds
    min_seconds: u64,
    /// Upper bound, in seconds
    max_seconds: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(5, 300)
    }
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in seconds
    #[must_use]
    pub const fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            max_seconds,
        }
    }

    /// Longest delay this schedule ever returns
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_seconds)
    }

    /// Calculate the backoff for a given number of consecutive errors (stateless)
    ///
    /// The sequence starts at `min_seconds` for error counts 0 and 1, then follows
    /// the Fibonacci sequence: min, min, min*2, min*3, min*5, min*8, etc., capped at
    /// `max_seconds`.
    #[must_use]
    pub fn for_error_count(&self, error_count: u32) -> Duration {
        if error_count <= 1 {
            return Duration::from_secs(self.min_seconds.min(self.max_seconds));
        }

        let mut prev = self.min_seconds;
        let mut current = self.min_seconds;
        for _ in 2..=error_count {
            let next = prev.saturating_add(current);
            prev = current;
            current = next.min(self.max_seconds);
            if current >= self.max_seconds {
                break;
            }
        }

        Duration::from_secs(current)
    }
}

/// Bounded exponential schedule for optimistic-concurrency retries
///
/// `steps` is the total number of attempts, so at most `steps - 1` sleeps happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictBackoff {
    /// Total number of attempts, including the first one
    pub steps: u32,
    /// Delay after the first conflict
    pub initial: Duration,
    /// Multiplier applied after each further conflict
    pub factor: u32,
    /// Upper bound for a single delay
    pub cap: Duration,
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            steps: 5,
            initial: Duration::from_millis(10),
            factor: 2,
            cap: Duration::from_secs(1),
        }
    }
}

impl ConflictBackoff {
    /// Delay to wait after the given failed attempt (1-based)
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(multiplier).min(self.cap)
    }
}
