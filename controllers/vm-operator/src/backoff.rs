//! # Fibonacci Backoff
//!
//! Progressive backoff for reconciliation retries. Grows more slowly than
//! exponential backoff: min, min, 2·min, 3·min, 5·min, ... capped at max.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, starting from `min` and
/// capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    prev: Duration,
    current: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = next.min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min.min(self.max);
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(ms(200), ms(5000));

        assert_eq!(backoff.next_backoff(), ms(200));
        assert_eq!(backoff.next_backoff(), ms(200));
        assert_eq!(backoff.next_backoff(), ms(400));
        assert_eq!(backoff.next_backoff(), ms(600));
        assert_eq!(backoff.next_backoff(), ms(1000));
        assert_eq!(backoff.next_backoff(), ms(1600));
        assert_eq!(backoff.next_backoff(), ms(2600));
        assert_eq!(backoff.next_backoff(), ms(4200));
        // Next would be 6800ms, capped at 5000ms
        assert_eq!(backoff.next_backoff(), ms(5000));
        assert_eq!(backoff.next_backoff(), ms(5000));
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(ms(100), ms(1000));

        backoff.next_backoff();
        backoff.next_backoff();
        assert_eq!(backoff.next_backoff(), ms(200));

        backoff.reset();

        // Should restart from beginning after success
        assert_eq!(backoff.next_backoff(), ms(100));
        assert_eq!(backoff.next_backoff(), ms(100));
    }
}
