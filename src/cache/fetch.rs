//! Fetch coordination: one in-flight fetch per key, result bookkeeping, and
//! the background refresh loop for refreshing types.

use super::entry::{CacheEntry, CacheKey};
use super::metrics::Counter;
use super::types::{AnyValue, DEFAULT_QUERY_TIMEOUT, FetchOptions, FetchResult};
use super::{Cache, CacheError, GetRequest};
use crate::utils::{fmt_duration, random_stagger};
use crate::waiter::Waiter;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

/// Consecutive failures tolerated before refreshes start backing off.
pub(crate) const REFRESH_BACKOFF_MIN: u32 = 3;

/// Upper bound on the backoff between failing refreshes.
pub(crate) const REFRESH_MAX_WAIT: Duration = Duration::from_secs(60);

/// A blocking refresh that has been open this long without failing is
/// considered connected again.
const CONNECTED_AFTER: Duration = Duration::from_secs(31);

/// Delay before retrying after `failures` consecutive failed or empty
/// fetches. Zero until the failure count passes [`REFRESH_BACKOFF_MIN`],
/// then doubling per failure up to [`REFRESH_MAX_WAIT`], plus a random
/// stagger of up to the same amount.
pub(crate) fn backoff_wait(failures: u32) -> Duration {
    if failures <= REFRESH_BACKOFF_MIN {
        return Duration::ZERO;
    }
    let shift = (failures - REFRESH_BACKOFF_MIN).min(16);
    let wait = Duration::from_secs(1u64 << shift).min(REFRESH_MAX_WAIT);
    wait + random_stagger(wait)
}

/// Identifies the fetch currently allowed to write results for a key.
/// Starting a new fetch cancels the previous handle so a stale fetch cannot
/// overwrite newer state.
#[derive(Debug, Clone)]
pub(crate) struct FetchHandle {
    id: u64,
    stop: CancellationToken,
}

#[derive(Debug, Default)]
pub(crate) struct FetchHandles {
    last_id: u64,
    by_key: HashMap<CacheKey, FetchHandle>,
}

impl FetchHandles {
    fn replace(&mut self, key: &CacheKey) -> FetchHandle {
        if let Some(previous) = self.by_key.remove(key) {
            previous.stop.cancel();
        }
        self.last_id += 1;
        let handle = FetchHandle {
            id: self.last_id,
            stop: CancellationToken::new(),
        };
        self.by_key.insert(key.clone(), handle.clone());
        handle
    }

    fn release(&mut self, key: &CacheKey, id: u64) {
        if self.by_key.get(key).is_some_and(|h| h.id == id) {
            self.by_key.remove(key);
        }
    }
}

struct ReleaseHandle<'a> {
    cache: &'a Cache,
    key: &'a CacheKey,
    id: u64,
}

impl Drop for ReleaseHandle<'_> {
    fn drop(&mut self) {
        self.cache.inner.handles.lock().release(self.key, self.id);
    }
}

impl Cache {
    /// Ensures a fetch is running for `key` and returns a waiter that fires
    /// when it completes.
    ///
    /// The waiter has already fired when the entry is valid (unless
    /// `ignore_existing`) or when it does not exist and `allow_new` is unset.
    /// If a fetch is already in flight its waiter is shared.
    pub(crate) fn fetch(
        &self,
        key: CacheKey,
        req: &GetRequest,
        allow_new: bool,
        attempt: u32,
        ignore_existing: bool,
    ) -> Waiter {
        let (entry, handle) = {
            let mut store = self.inner.store.write();
            let (existing, valid) = store.lookup(&req.type_entry.opts, &key, &req.info);

            let mut entry = match existing {
                None if !allow_new => return Waiter::fired(),
                None => CacheEntry::new(self.inner.options.read().limiter()),
                Some(_) if valid && !ignore_existing => return Waiter::fired(),
                Some(entry) => entry,
            };
            if entry.fetching {
                return entry.waiter;
            }

            entry.fetching = true;
            store.entries.insert(key.clone(), entry.clone());
            let handle = self.inner.handles.lock().replace(&key);
            (entry, handle)
        };

        let waiter = entry.waiter.clone();
        let span = debug_span!("fetch", key = %key, attempt);
        tokio::spawn(
            self.clone()
                .run_fetch(key, req.clone(), entry, attempt, handle)
                .instrument(span),
        );
        waiter
    }

    async fn run_fetch(
        self,
        key: CacheKey,
        mut req: GetRequest,
        entry: CacheEntry,
        mut attempt: u32,
        handle: FetchHandle,
    ) {
        let _release = ReleaseHandle {
            cache: &self,
            key: &key,
            id: handle.id,
        };
        let opts = req.type_entry.opts.clone();

        let connected = (opts.refresh
            && entry.index > 0
            && opts.supports_blocking
            && opts.query_timeout.max(DEFAULT_QUERY_TIMEOUT) > CONNECTED_AFTER)
            .then(|| self.spawn_connected_timer(key.clone()));

        let mut fetch_opts = FetchOptions::default();
        if opts.supports_blocking {
            fetch_opts.min_index = entry.index;
            fetch_opts.timeout = if opts.query_timeout.is_zero() {
                DEFAULT_QUERY_TIMEOUT
            } else {
                opts.query_timeout
            };
        }
        if entry.valid {
            fetch_opts.last_result = Some(FetchResult {
                value: entry.value.clone(),
                state: entry.state.clone(),
                index: entry.index,
                not_modified: false,
            });
        }

        if !entry.fetch_limiter.acquire(&self.inner.stop).await {
            if let Some(timer) = connected {
                timer.abort();
            }
            self.abandon_fetch(&key, &handle, CacheError::RateLimiterClosed);
            return;
        }

        let started = Instant::now();
        let result = req
            .type_entry
            .typ
            .fetch(fetch_opts, req.request.clone())
            .await;
        if let Some(timer) = connected {
            timer.abort();
        }

        if handle.stop.is_cancelled() {
            trace!(key = %key, "discarding result from a superseded fetch");
            return;
        }

        let mut next = entry.clone();
        next.fetching = false;
        match result {
            Ok(result) => {
                self.inner.counters.incr(Counter::FetchSuccess);
                let index = result.index;
                apply_result(&mut next, result);
                if opts.refresh {
                    next.refresh_lost_contact = None;
                }
                // An index of zero means the source could not tell us whether
                // anything changed; treat it like a failure for backoff purposes.
                if index > 0 {
                    attempt = 0;
                } else {
                    attempt += 1;
                }
                debug!(
                    key = %key,
                    index = next.index,
                    duration = fmt_duration(started.elapsed()),
                    "fetch completed"
                );
            }
            Err(err) => {
                self.inner.counters.incr(Counter::FetchError);
                attempt += 1;
                if opts.refresh && next.refresh_lost_contact.is_none() {
                    next.refresh_lost_contact = Some(Instant::now());
                }
                warn!(key = %key, attempt, error = %err, "fetch failed");
                next.error = Some(err);
            }
        }
        next.waiter = Waiter::new();

        {
            let mut store = self.inner.store.write();
            let Some(current) = store.entries.get(&key) else {
                // Evicted while fetching. Waiters will create a fresh entry.
                drop(store);
                entry.waiter.fire();
                return;
            };
            next.fetch_limiter = current.fetch_limiter.clone();
            next.expiry = current.expiry.clone();

            let indexed = next.expiry.as_ref().and_then(|e| e.index()).is_some();
            if !indexed {
                next.expiry = Some(store.expiry.add(key.clone(), opts.last_get_ttl));
            }
            store.entries.insert(key.clone(), next);
        }
        entry.waiter.fire();

        if !opts.refresh || self.inner.stop.is_cancelled() {
            return;
        }

        let wait = backoff_wait(attempt) + opts.refresh_timer;
        if !wait.is_zero() {
            trace!(key = %key, wait = fmt_duration(wait), attempt, "scheduling refresh");
        }
        tokio::select! {
            _ = sleep(wait) => {}
            _ = handle.stop.cancelled() => return,
            _ = self.inner.stop.cancelled() => return,
        }

        req.info.must_revalidate = false;
        req.info.min_index = 0;
        self.fetch(key.clone(), &req, false, attempt, true);
    }

    /// Clears the in-flight flag without a result and wakes waiters with
    /// `err`.
    fn abandon_fetch(&self, key: &CacheKey, handle: &FetchHandle, err: CacheError) {
        if handle.stop.is_cancelled() {
            return;
        }
        let previous = {
            let mut store = self.inner.store.write();
            let Some(entry) = store.entries.get_mut(key) else {
                return;
            };
            entry.fetching = false;
            entry.error = Some(err);
            std::mem::replace(&mut entry.waiter, Waiter::new())
        };
        previous.fire();
    }

    fn spawn_connected_timer(&self, key: CacheKey) -> JoinHandle<()> {
        let store = self.inner.store.clone();
        tokio::spawn(async move {
            sleep(CONNECTED_AFTER).await;
            if let Some(entry) = store.write().entries.get_mut(&key) {
                entry.refresh_lost_contact = None;
            }
        })
    }
}

/// Folds a successful fetch into the entry. A not-modified result keeps the
/// stored value but takes the new index; an empty result only updates the
/// state.
fn apply_result(entry: &mut CacheEntry, result: FetchResult<AnyValue>) {
    entry.error = None;
    if result.state.is_some() {
        entry.state = result.state;
    }

    let keep_value = result.not_modified && entry.valid;
    match result.value {
        Some(value) if !keep_value => entry.value = Some(value),
        None if !keep_value => return,
        _ => {}
    }
    entry.index = result.index.max(1);
    entry.fetched_at = Some(Instant::now());
    entry.valid = true;
}
