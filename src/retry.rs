//! Exponential retry delays for long-running subscription loops.

use rand::Rng;
use std::time::Duration;

/// Tracks consecutive failures and computes how long to wait before the next
/// attempt.
///
/// The first `min_failures` failures wait `min_wait`. After that the delay
/// doubles per failure, starting from `factor`, and is clamped to
/// `[min_wait, max_wait]`. `jitter_percent` shaves a random share off each
/// delay so reconnecting clients spread out.
#[derive(Debug, Clone)]
pub struct RetryWaiter {
    pub min_failures: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub factor: Duration,
    pub jitter_percent: u8,
    failures: u32,
}

impl RetryWaiter {
    pub fn new(min_failures: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            min_failures,
            min_wait,
            max_wait,
            factor: Duration::from_secs(1),
            jitter_percent: 0,
            failures: 0,
        }
    }

    pub fn with_factor(mut self, factor: Duration) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_jitter(mut self, percent: u8) -> Self {
        self.jitter_percent = percent.min(100);
        self
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.jitter(self.delay())
    }

    fn delay(&self) -> Duration {
        if self.failures <= self.min_failures {
            return self.min_wait;
        }

        let shift = (self.failures - self.min_failures - 1).min(31);
        let wait = self
            .factor
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_wait);

        wait.clamp(self.min_wait, self.max_wait.max(self.min_wait))
    }

    fn jitter(&self, wait: Duration) -> Duration {
        if self.jitter_percent == 0 || wait.is_zero() {
            return wait;
        }
        let max_cut = wait.as_secs_f64() * f64::from(self.jitter_percent) / 100.0;
        let cut = rand::rng().random_range(0.0..=max_cut);
        wait.saturating_sub(Duration::from_secs_f64(cut))
    }
}

impl Default for RetryWaiter {
    fn default() -> Self {
        Self::new(0, Duration::ZERO, Duration::from_secs(60)).with_jitter(20)
    }
}
