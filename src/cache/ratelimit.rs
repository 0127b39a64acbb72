//! Per-entry fetch throttling.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ENTRY_FETCH_MAX_BURST: u32 = 2;

/// Token bucket shared by every fetch of one entry. `None` means unlimited.
#[derive(Clone, Default)]
pub(crate) struct FetchLimiter(Option<Arc<DefaultDirectRateLimiter>>);

impl fmt::Debug for FetchLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchLimiter")
            .field(&self.is_limited())
            .finish()
    }
}

impl FetchLimiter {
    pub fn unlimited() -> Self {
        Self(None)
    }

    /// `rate` is fetches per second. Non-finite or non-positive rates mean
    /// unlimited.
    pub fn new(rate: Option<f64>, burst: u32) -> Self {
        let Some(rate) = rate.filter(|r| r.is_finite() && *r > 0.0) else {
            return Self::unlimited();
        };
        let burst = NonZeroU32::new(burst)
            .or(NonZeroU32::new(DEFAULT_ENTRY_FETCH_MAX_BURST))
            .unwrap_or(NonZeroU32::MIN);

        let period = Duration::from_secs_f64(1.0 / rate);
        match Quota::with_period(period) {
            Some(quota) => Self(Some(Arc::new(RateLimiter::direct(quota.allow_burst(burst))))),
            None => Self::unlimited(),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.0.is_some()
    }

    /// Waits for a token. Returns `false` if `stop` fires first.
    pub async fn acquire(&self, stop: &CancellationToken) -> bool {
        let Some(limiter) = &self.0 else {
            return !stop.is_cancelled();
        };
        tokio::select! {
            _ = limiter.until_ready() => true,
            _ = stop.cancelled() => false,
        }
    }
}
