//! Cache keys, stored entries, and the lock-protected store that holds both
//! the entries and their expiry heap.

use super::errors::CacheError;
use super::expiry::{ExpiryEntry, ExpiryHeap};
use super::ratelimit::FetchLimiter;
use super::types::{AnyValue, EntryState, RegisterOptions, RequestInfo};
use crate::waiter::Waiter;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of a cached entry. Requests from different tokens, datacenters
/// or peers never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    type_name: Arc<str>,
    partition: String,
    token: String,
    key: String,
}

impl CacheKey {
    pub fn new(type_name: &str, info: &RequestInfo) -> Self {
        let partition = if info.peer_name.is_empty() {
            info.datacenter.clone()
        } else {
            format!("peer:{}", info.peer_name)
        };
        Self {
            type_name: type_name.into(),
            partition,
            token: info.token.clone(),
            key: info.key.clone(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.type_name, self.partition, self.token, self.key
        )
    }
}

#[derive(Clone)]
pub(crate) struct CacheEntry {
    pub value: Option<AnyValue>,
    pub state: Option<Arc<dyn EntryState>>,
    /// Error from the most recent fetch, cleared by the next success.
    pub error: Option<CacheError>,
    pub valid: bool,
    pub index: u64,
    pub fetched_at: Option<Instant>,
    /// Set when a refreshing entry starts failing; used as the age anchor
    /// while the backend is unreachable.
    pub refresh_lost_contact: Option<Instant>,
    pub fetching: bool,
    /// Fired when the next fetch for this entry completes.
    pub waiter: Waiter,
    pub expiry: Option<Arc<ExpiryEntry<CacheKey>>>,
    pub fetch_limiter: FetchLimiter,
}

impl CacheEntry {
    pub fn new(fetch_limiter: FetchLimiter) -> Self {
        Self {
            value: None,
            state: None,
            error: None,
            valid: false,
            index: 0,
            fetched_at: None,
            refresh_lost_contact: None,
            fetching: false,
            waiter: Waiter::new(),
            expiry: None,
            fetch_limiter,
        }
    }

    /// Staleness reported to callers. Refreshing entries are fresh until the
    /// background loop loses contact; others age from their last fetch.
    pub fn age(&self, refresh: bool, now: Instant) -> Duration {
        let since = if refresh {
            self.refresh_lost_contact
        } else {
            self.fetched_at
        };
        since
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }

    fn exceeds_max_age(&self, max_age: Duration) -> bool {
        self.fetched_at
            .is_some_and(|at| at.elapsed() > max_age)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("valid", &self.valid)
            .field("index", &self.index)
            .field("fetching", &self.fetching)
            .field("error", &self.error)
            .field("has_value", &self.value.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct EntryStore {
    pub entries: HashMap<CacheKey, CacheEntry>,
    pub expiry: ExpiryHeap<CacheKey>,
}

impl EntryStore {
    /// Looks up `key` and decides whether its value can be served to a
    /// request with the given parameters. Returns a snapshot of the entry.
    pub fn lookup(
        &self,
        opts: &RegisterOptions,
        key: &CacheKey,
        info: &RequestInfo,
    ) -> (Option<CacheEntry>, bool) {
        let Some(entry) = self.entries.get(key) else {
            return (None, false);
        };

        let valid = if !entry.valid {
            false
        } else if opts.supports_blocking && info.min_index > 0 && info.min_index >= entry.index {
            false
        } else if !opts.refresh && !info.max_age.is_zero() && entry.exceeds_max_age(info.max_age)
        {
            false
        } else if !opts.refresh && info.must_revalidate {
            // A fetch that is already in flight counts as revalidating.
            entry.fetching
        } else {
            true
        };

        (Some(entry.clone()), valid)
    }

    /// Pushes the entry's idle deadline out by `ttl`.
    pub fn touch(&mut self, key: &CacheKey, ttl: Duration) {
        let Some(expiry) = self.entries.get(key).and_then(|e| e.expiry.clone()) else {
            return;
        };
        self.expiry.update(&expiry, ttl);
    }
}
