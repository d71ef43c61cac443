//! # Fibonacci Backoff
//!
//! Progressive backoff for failed BindingConfig reconciliations. It grows more
//! slowly than exponential backoff, so a config that keeps failing is retried
//! steadily without hammering the API server.
//!
//! Values are tracked in milliseconds so the bounds can come straight from
//! `BACKOFF_START_MS` / `BACKOFF_MAX_MS`.
//!
//! ## Usage
//!
//! ```rust
//! use service_mapper_controller::controller::backoff::FibonacciBackoff;
//!
//! let mut backoff = FibonacciBackoff::new(1000, 10_000);
//! assert_eq!(backoff.next_backoff_ms(), 1000);
//! assert_eq!(backoff.next_backoff_ms(), 1000);
//! assert_eq!(backoff.next_backoff_ms(), 2000);
//! assert_eq!(backoff.next_backoff_ms(), 3000);
//! assert_eq!(backoff.next_backoff_ms(), 5000);
//! ```

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_ms`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_ms: u64,
    prev_ms: u64,
    current_ms: u64,
    max_ms: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_ms` and capped at `max_ms`
    #[must_use]
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        let min_ms = min_ms.max(1);
        Self {
            min_ms,
            prev_ms: 0,
            current_ms: min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    /// Get the next backoff in milliseconds and advance the sequence
    pub fn next_backoff_ms(&mut self) -> u64 {
        let result = self.current_ms;
        let next = self.prev_ms.saturating_add(self.current_ms);
        self.prev_ms = self.current_ms;
        self.current_ms = std::cmp::min(next, self.max_ms);
        result
    }

    /// Get the next backoff as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_millis(self.next_backoff_ms())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_ms = 0;
        self.current_ms = self.min_ms;
    }
}
