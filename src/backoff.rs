//! Exponential backoff with optional jitter
//!
//! The delay for attempt `n` is `min × factor^n`, clamped to `max`. With
//! jitter enabled the delay is drawn uniformly between `min` and that value.
//! The base delay depends only on the attempt number, so jitter never feeds
//! back into later delays.

use rand::Rng;
use std::time::Duration;

/// Delay generator that remembers how many delays it has handed out.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self {
            min,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// Return the next delay and advance the attempt counter.
    pub fn duration(&mut self) -> Duration {
        let delay = self.for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Compute the delay for `attempt` (0-indexed) without advancing.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        let min = self.min.min(self.max);
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = min.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else if secs < min.as_secs_f64() {
            min
        } else {
            Duration::from_secs_f64(secs)
        };

        if !self.jitter || base <= min {
            return base;
        }

        let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=base.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Number of delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
