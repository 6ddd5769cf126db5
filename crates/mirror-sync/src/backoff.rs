//! # Fibonacci Backoff
//!
//! Provides a Fibonacci-based backoff for webhook retries and watch
//! stream restarts. The sequence grows more slowly than exponential
//! backoff, which suits operations that may need several retries without
//! going quiet for long stretches.
//!
//! Default sequence with min 1s, max 30s: 1s, 1s, 2s, 3s, 5s, 8s, 13s,
//! 21s, 30s (capped).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, capped at a maximum.
/// Reset after a success so the next failure starts from the minimum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum delay in seconds (for reset)
    min_secs: u64,
    /// Previous delay in seconds
    prev_secs: u64,
    /// Current delay in seconds
    current_secs: u64,
    /// Maximum delay in seconds
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Creates a backoff with the given minimum and maximum delays in seconds.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_secs);
        let next_secs = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = std::cmp::min(next_secs, self.max_secs);
        result
    }

    /// Resets the sequence to the minimum after a success.
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}
