//! Exponential backoff schedule shared by stat generation, file transfer and
//! dashboard registration retries.

use std::time::Duration;

/// Bounded exponential backoff: `initial * factor^n`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: u32,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    /// The engine-wide default schedule: 1s, 2s, 4s, ... capped at 60s.
    pub fn new(max_attempts: u32) -> Self {
        Self::with_schedule(Duration::from_secs(1), 2, Duration::from_secs(60), max_attempts)
    }

    pub fn with_schedule(
        initial: Duration,
        factor: u32,
        cap: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial,
            factor,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or None once attempts are exhausted.
    /// The first call yields the initial delay.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.max_attempts {
            return None;
        }
        let exp = self.initial.saturating_mul(self.factor.saturating_pow(self.attempt));
        self.attempt += 1;
        Some(exp.min(self.cap))
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}
