//! Bounded waits.
//!
//! Header visibility, mailbox slot acquisition and handshake polling each take
//! a [`RetryPolicy`].

use std::time::Duration;

/// How many times to try and how long to wait in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub delay: Duration,
    /// Multiplier applied to the delay after each failed attempt (1 = fixed).
    pub backoff: u32,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: 1,
        }
    }

    /// Delay grows by `factor` after every failed attempt.
    pub const fn exponential(max_attempts: u32, delay: Duration, factor: u32) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: factor,
        }
    }

    /// A single attempt, no waiting.
    pub const fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay that precedes attempt number `attempt` (zero-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff.max(1).saturating_pow(attempt - 1);
        self.delay.saturating_mul(factor)
    }

    /// Runs `op` until it yields `Some`, sleeping between attempts.
    ///
    /// Returns `None` once the attempts are exhausted.
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Option<T>) -> Option<T> {
        for attempt in 0..self.max_attempts.max(1) {
            pause(self.delay_before(attempt));
            if let Some(value) = op(attempt) {
                return Some(value);
            }
        }
        None
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_micros(10))
    }
}

fn pause(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    if delay < Duration::from_micros(50) {
        // Sleeping rounds up to scheduler granularity; spin briefly instead.
        let start = std::time::Instant::now();
        while start.elapsed() < delay {
            std::hint::spin_loop();
        }
    } else {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_first_success() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let mut calls = 0;
        let out = policy.run(|attempt| {
            calls += 1;
            (attempt == 2).then_some(attempt)
        });
        assert_eq!(out, Some(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausts_attempts() {
        let policy = RetryPolicy::fixed(4, Duration::ZERO);
        let mut calls = 0;
        let out: Option<()> = policy.run(|_| {
            calls += 1;
            None
        });
        assert!(out.is_none());
        assert_eq!(calls, 4);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _: Option<()> = RetryPolicy::fixed(0, Duration::ZERO).run(|_| {
            calls += 1;
            None
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn exponential_backoff_schedule() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(1), 2);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_millis(1));
        assert_eq!(policy.delay_before(2), Duration::from_millis(2));
        assert_eq!(policy.delay_before(3), Duration::from_millis(4));
    }
}
