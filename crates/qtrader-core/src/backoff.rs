//! Exponential backoff with jitter
//!
//! Shared by gateway retries and feed reconnection.

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff
///
/// Delay for attempt `n` (zero based) is `min(base * 2^n, max)` plus up to a quarter of that
/// as jitter. Call [`Backoff::reset`] after one fully successful cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay before jitter for the given attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay for the current attempt, advancing the attempt counter
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = rng.gen_range(0..=(delay.as_millis() as u64 / 4));
        delay + Duration::from_millis(jitter_ms)
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
