use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Running totals for a cache. Read with [`Counters::snapshot`].
#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    miss_new: AtomicU64,
    miss_block: AtomicU64,
    bypass: AtomicU64,
    fetch_success: AtomicU64,
    fetch_error: AtomicU64,
    evict_expired: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Hit,
    MissNew,
    MissBlock,
    Bypass,
    FetchSuccess,
    FetchError,
    EvictExpired,
}

impl Counters {
    pub fn incr(&self, counter: Counter) {
        let slot = match counter {
            Counter::Hit => &self.hits,
            Counter::MissNew => &self.miss_new,
            Counter::MissBlock => &self.miss_block,
            Counter::Bypass => &self.bypass,
            Counter::FetchSuccess => &self.fetch_success,
            Counter::FetchError => &self.fetch_error,
            Counter::EvictExpired => &self.evict_expired,
        };
        let total = slot.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(counter = ?counter, total, "cache counter");
    }

    pub fn snapshot(&self, entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            miss_new: self.miss_new.load(Ordering::Relaxed),
            miss_block: self.miss_block.load(Ordering::Relaxed),
            bypass: self.bypass.load(Ordering::Relaxed),
            fetch_success: self.fetch_success.load(Ordering::Relaxed),
            fetch_error: self.fetch_error.load(Ordering::Relaxed),
            evict_expired: self.evict_expired.load(Ordering::Relaxed),
            entries,
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    /// Misses on keys with no usable value.
    pub miss_new: u64,
    /// Misses while waiting for an index newer than the cached one.
    pub miss_block: u64,
    /// Requests with an empty key, served without caching.
    pub bypass: u64,
    pub fetch_success: u64,
    pub fetch_error: u64,
    pub evict_expired: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn misses(&self) -> u64 {
        self.miss_new + self.miss_block
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
