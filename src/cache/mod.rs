//! Read-through cache for agent requests.
//!
//! Types register a fetch function and their caching behavior. Callers read
//! through [`Cache::get`], which serves a stored value when it satisfies the
//! request and otherwise waits on a single shared fetch per key. Entries that
//! go unread for their type's idle TTL are evicted by a background reaper.

mod entry;
mod errors;
mod expiry;
mod fetch;
mod metrics;
mod ratelimit;
mod types;
mod watch;

pub use entry::CacheKey;
pub use errors::CacheError;
pub use expiry::{ExpiryEntry, ExpiryHeap, NextExpiry};
pub use metrics::CacheStats;
pub use ratelimit::DEFAULT_ENTRY_FETCH_MAX_BURST;
pub use types::{
    CacheType, DEFAULT_LAST_GET_TTL, DEFAULT_QUERY_TIMEOUT, EntryState, FetchOptions, FetchResult,
    RegisterOptions, Request, RequestInfo, TypeKey,
};
pub use watch::UpdateEvent;

use entry::{CacheEntry, EntryStore};
use fetch::FetchHandles;
use metrics::{Counter, Counters};
use parking_lot::{Mutex, RwLock};
use ratelimit::FetchLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use types::{AnyRequest, AnyValue, Erased, TypeEntry, downcast_value};

/// Cache-wide settings that can be changed at runtime with
/// [`Cache::reload_options`].
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Fetches per second allowed for a single entry. `None` is unlimited.
    pub entry_fetch_rate: Option<f64>,
    pub entry_fetch_max_burst: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            entry_fetch_rate: None,
            entry_fetch_max_burst: DEFAULT_ENTRY_FETCH_MAX_BURST,
        }
    }
}

impl Options {
    fn with_defaults(mut self) -> Self {
        if self
            .entry_fetch_rate
            .is_some_and(|r| !r.is_finite() || r <= 0.0)
        {
            self.entry_fetch_rate = None;
        }
        if self.entry_fetch_max_burst == 0 {
            self.entry_fetch_max_burst = DEFAULT_ENTRY_FETCH_MAX_BURST;
        }
        self
    }

    fn limiter(&self) -> FetchLimiter {
        FetchLimiter::new(self.entry_fetch_rate, self.entry_fetch_max_burst)
    }
}

/// Metadata returned alongside every cached value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultMeta {
    /// Served from the cache without waiting on a fetch.
    pub hit: bool,
    /// For refreshing types, time since the background loop lost contact.
    /// Otherwise time since the value was fetched.
    pub age: Duration,
    pub index: u64,
}

/// A failed read, with whatever was stored for the key when it gave up.
#[derive(Debug, Clone)]
pub struct StaleRead<V> {
    pub err: CacheError,
    pub value: Option<V>,
    pub meta: ResultMeta,
}

impl<V> From<CacheError> for StaleRead<V> {
    fn from(err: CacheError) -> Self {
        Self {
            err,
            value: None,
            meta: ResultMeta::default(),
        }
    }
}

/// A resolved request: the registered type plus the erased request value.
#[derive(Clone)]
pub(crate) struct GetRequest {
    pub type_entry: TypeEntry,
    pub info: RequestInfo,
    pub request: AnyRequest,
}

#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

struct Inner {
    types: dashmap::DashMap<Arc<str>, TypeEntry>,
    store: Arc<RwLock<EntryStore>>,
    handles: Mutex<FetchHandles>,
    options: RwLock<Options>,
    stop: CancellationToken,
    counters: Arc<Counters>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Cache {
    /// Creates a cache and starts its expiry reaper. Must be called from
    /// within a Tokio runtime.
    pub fn new(options: Options) -> Self {
        let store = Arc::new(RwLock::new(EntryStore::default()));
        let notify = store.read().expiry.notifier();
        let stop = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        tokio::spawn(run_expiry_loop(
            store.clone(),
            notify,
            stop.clone(),
            counters.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                types: dashmap::DashMap::new(),
                store,
                handles: Mutex::new(FetchHandles::default()),
                options: RwLock::new(options.with_defaults()),
                stop,
                counters,
            }),
        }
    }

    /// Registers a type under `name`. Registering the same name again
    /// replaces the previous registration.
    pub fn register_type<T: CacheType>(
        &self,
        name: &str,
        typ: T,
        opts: RegisterOptions,
    ) -> TypeKey<T> {
        let name: Arc<str> = name.into();
        let entry = TypeEntry {
            name: name.clone(),
            typ: Arc::new(Erased::new(name.clone(), typ)),
            opts: opts.with_defaults(),
        };
        if self.inner.types.insert(name.clone(), entry).is_some() {
            warn!(type_name = %name, "replaced an existing cache type registration");
        }
        TypeKey::new(name)
    }

    /// Reads through the cache.
    ///
    /// Returns the stored value when it satisfies `req`, otherwise waits for a
    /// fetch. For blocking types with a `min_index`, waits until a newer index
    /// arrives or the request's timeout passes; on timeout the current value is
    /// returned without an error. Errors are only returned after at least one
    /// fetch was attempted on this call's behalf.
    pub async fn get<T: CacheType>(
        &self,
        cancel: &CancellationToken,
        typ: &TypeKey<T>,
        req: T::Request,
    ) -> Result<(Option<T::Value>, ResultMeta), CacheError> {
        self.get_or_stale(cancel, typ, req).await.map_err(|e| e.err)
    }

    /// Like [`Cache::get`], but a failed read also hands back the value that
    /// was stored for the key, if any.
    pub async fn get_or_stale<T: CacheType>(
        &self,
        cancel: &CancellationToken,
        typ: &TypeKey<T>,
        req: T::Request,
    ) -> Result<(Option<T::Value>, ResultMeta), StaleRead<T::Value>> {
        let request = self.resolve(typ.name(), req)?;
        match self.get_with_index(cancel, request).await {
            Ok((value, meta)) => Ok((downcast_value(typ.name(), value)?, meta)),
            Err(stale) => Err(StaleRead {
                value: downcast_value(typ.name(), stale.value)?,
                err: stale.err,
                meta: stale.meta,
            }),
        }
    }

    /// Seeds an entry with a known result. The key is taken from `info`.
    pub fn prepopulate<T: CacheType>(
        &self,
        typ: &TypeKey<T>,
        result: FetchResult<T::Value>,
        info: &RequestInfo,
    ) -> Result<(), CacheError> {
        let key = CacheKey::new(typ.name(), info);
        let ttl = self
            .inner
            .types
            .get(typ.name())
            .map(|t| t.opts.last_get_ttl);

        let mut entry = CacheEntry::new(self.inner.options.read().limiter());
        entry.valid = true;
        entry.value = result.value.map(|v| Arc::new(v) as AnyValue);
        entry.state = result.state;
        entry.index = result.index;
        entry.fetched_at = Some(Instant::now());

        let mut store = self.inner.store.write();
        if let Some(previous) = store.entries.get(&key) {
            // An in-flight fetch keeps its flag and waiters.
            entry.fetching = previous.fetching;
            entry.waiter = previous.waiter.clone();
            entry.fetch_limiter = previous.fetch_limiter.clone();
            entry.expiry = previous.expiry.clone();
        }
        // Unregistered types have no idle TTL yet; the first fetch adds one.
        if let Some(ttl) = ttl {
            if let Some(expiry) = &entry.expiry {
                store.expiry.update(expiry, ttl);
            } else {
                entry.expiry = Some(store.expiry.add(key.clone(), ttl));
            }
        }
        debug!(key = %key, index = entry.index, "prepopulated cache entry");
        store.entries.insert(key, entry);
        Ok(())
    }

    /// Applies new rate limit settings to every entry. Returns `false` when
    /// the settings are unchanged.
    pub fn reload_options(&self, options: Options) -> bool {
        let options = options.with_defaults();
        {
            let mut current = self.inner.options.write();
            if *current == options {
                return false;
            }
            *current = options.clone();
        }

        let mut store = self.inner.store.write();
        for entry in store.entries.values_mut() {
            entry.fetch_limiter = options.limiter();
        }
        info!(
            entry_fetch_rate = ?options.entry_fetch_rate,
            entry_fetch_max_burst = options.entry_fetch_max_burst,
            entries = store.entries.len(),
            "reloaded cache options"
        );
        true
    }

    /// Stops the reaper and every background refresh. Safe to call more
    /// than once.
    pub fn close(&self) {
        if self.inner.stop.is_cancelled() {
            return;
        }
        self.inner.stop.cancel();

        // Entry state such as a running subscription stops with the cache;
        // stored values stay readable.
        let states: Vec<_> = self
            .inner
            .store
            .read()
            .entries
            .values()
            .filter_map(|e| e.state.clone())
            .collect();
        for state in &states {
            state.close();
        }
        info!(closed_states = states.len(), "cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.store.read().entries.len();
        self.inner.counters.snapshot(entries)
    }

    fn type_entry(&self, name: &str) -> Result<TypeEntry, CacheError> {
        self.inner
            .types
            .get(name)
            .map(|t| t.value().clone())
            .ok_or_else(|| CacheError::UnknownType(name.to_string()))
    }

    pub(crate) fn resolve<R: Request>(
        &self,
        type_name: &str,
        req: R,
    ) -> Result<GetRequest, CacheError> {
        Ok(GetRequest {
            type_entry: self.type_entry(type_name)?,
            info: req.cache_info(),
            request: Arc::new(req),
        })
    }

    pub(crate) async fn get_with_index(
        &self,
        cancel: &CancellationToken,
        mut req: GetRequest,
    ) -> Result<(Option<AnyValue>, ResultMeta), StaleRead<AnyValue>> {
        if req.info.key.is_empty() {
            return Ok(self.bypass(cancel, &req).await?);
        }

        let key = CacheKey::new(&req.type_entry.name, &req.info);
        let ttl = req.type_entry.opts.last_get_ttl;
        let refresh = req.type_entry.opts.refresh;
        let mut first = true;
        let mut deadline: Option<Instant> = None;

        loop {
            let (entry, valid) = {
                let mut store = self.inner.store.write();
                store.touch(&key, ttl);
                store.lookup(&req.type_entry.opts, &key, &req.info)
            };

            let entry = match (entry, valid) {
                (Some(entry), true) => {
                    if first {
                        self.inner.counters.incr(Counter::Hit);
                    }
                    let meta = ResultMeta {
                        hit: first,
                        age: entry.age(refresh, Instant::now()),
                        index: entry.index,
                    };
                    return Ok((entry.value, meta));
                }
                (entry, _) => entry,
            };

            // One fetch was already attempted for this call; surface its error
            // instead of spinning until the timeout.
            if !first
                && let Some(entry) = &entry
                && let Some(err) = entry.error.clone()
            {
                return Err(StaleRead {
                    err,
                    value: entry.value.clone(),
                    meta: ResultMeta {
                        age: entry.age(refresh, Instant::now()),
                        index: entry.index,
                        ..Default::default()
                    },
                });
            }

            if first {
                let miss = if req.info.min_index == 0 {
                    Counter::MissNew
                } else {
                    Counter::MissBlock
                };
                self.inner.counters.incr(miss);
                if !req.info.timeout.is_zero() {
                    deadline = Some(Instant::now() + req.info.timeout);
                }
            }

            let waiter = self.fetch(key.clone(), &req, true, 0, false);
            first = false;

            let (value, index) = entry.map(|e| (e.value, e.index)).unwrap_or((None, 0));
            let timeout = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(CacheError::Cancelled.into()),
                _ = waiter.wait() => {
                    req.info.must_revalidate = false;
                }
                _ = timeout => {
                    trace!(key = %key, index, "blocking get timed out");
                    return Ok((value, ResultMeta { index, ..Default::default() }));
                }
            }
        }
    }

    async fn bypass(
        &self,
        cancel: &CancellationToken,
        req: &GetRequest,
    ) -> Result<(Option<AnyValue>, ResultMeta), CacheError> {
        self.inner.counters.incr(Counter::Bypass);
        let opts = FetchOptions {
            min_index: req.info.min_index,
            timeout: req.info.timeout,
            last_result: None,
        };

        let result = tokio::select! {
            result = req.type_entry.typ.fetch(opts, req.request.clone()) => result?,
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        };
        let meta = ResultMeta {
            index: result.index,
            ..Default::default()
        };
        Ok((result.value, meta))
    }
}

/// Evicts entries as their idle deadline passes.
async fn run_expiry_loop(
    store: Arc<RwLock<EntryStore>>,
    notify: Arc<Notify>,
    stop: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let next = store.read().expiry.next();
        let expired = async {
            match &next {
                Some(next) => sleep_until(next.expires).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = stop.cancelled() => {
                debug!("expiry loop stopped");
                return;
            }
            _ = notify.notified() => continue,
            _ = expired => {}
        }

        let Some(next) = next else { continue };
        let evicted = {
            let mut store = store.write();
            // A read may have pushed the deadline out since we started waiting.
            if !store.expiry.is_expired(&next.entry, Instant::now()) {
                continue;
            }
            store.expiry.remove(&next.entry);
            // Only the entry's own node may evict it.
            let owned = store
                .entries
                .get(next.entry.key())
                .and_then(|e| e.expiry.as_ref())
                .is_some_and(|expiry| Arc::ptr_eq(expiry, &next.entry));
            if !owned {
                trace!(key = %next.entry.key(), "dropped stale expiry node");
                continue;
            }
            store.entries.remove(next.entry.key())
        };

        counters.incr(Counter::EvictExpired);
        debug!(key = %next.entry.key(), "evicted idle cache entry");
        if let Some(state) = evicted.and_then(|e| e.state) {
            state.close();
        }
    }
}
