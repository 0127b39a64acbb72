//! Cache type registration: the trait a data source implements, the options it
//! is registered with, and the type-erased adapter the cache stores.

use super::errors::CacheError;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Idle lifetime of an entry when the registration does not set one.
pub const DEFAULT_LAST_GET_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// Upper bound on a blocking query when the registration does not set one.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Caching parameters a request exposes to the cache.
///
/// An empty `key` means the request must not be cached. `min_index` and
/// `timeout` only matter for blocking types; `max_age` and `must_revalidate`
/// only matter for non-refreshing types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub key: String,
    pub token: String,
    pub datacenter: String,
    pub peer_name: String,
    pub min_index: u64,
    pub timeout: Duration,
    pub max_age: Duration,
    pub must_revalidate: bool,
}

pub trait Request: Clone + Send + Sync + 'static {
    fn cache_info(&self) -> RequestInfo;
}

/// Opaque per-entry state a type can attach to a result, such as a running
/// subscription. It is handed back on the next fetch and closed when the
/// entry is evicted.
pub trait EntryState: Any + Send + Sync {
    fn close(&self) {}

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// What the cache passes to a type's fetch.
pub struct FetchOptions<V> {
    pub min_index: u64,
    pub timeout: Duration,
    /// The previous result, present only when the entry holds a valid value.
    pub last_result: Option<FetchResult<V>>,
}

impl<V> Default for FetchOptions<V> {
    fn default() -> Self {
        Self {
            min_index: 0,
            timeout: Duration::ZERO,
            last_result: None,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for FetchOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("min_index", &self.min_index)
            .field("timeout", &self.timeout)
            .field("last_result", &self.last_result)
            .finish()
    }
}

pub struct FetchResult<V> {
    pub value: Option<V>,
    pub state: Option<Arc<dyn EntryState>>,
    pub index: u64,
    /// The backend confirmed the previous value is still current.
    pub not_modified: bool,
}

impl<V> FetchResult<V> {
    pub fn new(value: V, index: u64) -> Self {
        Self {
            value: Some(value),
            state: None,
            index,
            not_modified: false,
        }
    }

    pub fn empty(index: u64) -> Self {
        Self {
            value: None,
            state: None,
            index,
            not_modified: false,
        }
    }

    pub fn not_modified(index: u64) -> Self {
        Self {
            value: None,
            state: None,
            index,
            not_modified: true,
        }
    }

    pub fn with_state(mut self, state: Arc<dyn EntryState>) -> Self {
        self.state = Some(state);
        self
    }
}

impl<V: Clone> Clone for FetchResult<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            state: self.state.clone(),
            index: self.index,
            not_modified: self.not_modified,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for FetchResult<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResult")
            .field("value", &self.value)
            .field("has_state", &self.state.is_some())
            .field("index", &self.index)
            .field("not_modified", &self.not_modified)
            .finish()
    }
}

/// A data source the cache can fetch from.
#[async_trait]
pub trait CacheType: Send + Sync + 'static {
    type Request: Request;
    type Value: Clone + PartialEq + Send + Sync + 'static;

    async fn fetch(
        &self,
        opts: FetchOptions<Self::Value>,
        req: Self::Request,
    ) -> anyhow::Result<FetchResult<Self::Value>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// How long an entry may go unread before it is evicted.
    pub last_get_ttl: Duration,
    /// Keep the entry fresh with a background loop instead of fetching on read.
    pub refresh: bool,
    /// The source honors `min_index` and can hold a request open.
    pub supports_blocking: bool,
    /// Pause between background refreshes.
    pub refresh_timer: Duration,
    /// Server-side timeout for blocking fetches.
    pub query_timeout: Duration,
}

impl RegisterOptions {
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.last_get_ttl.is_zero() {
            self.last_get_ttl = DEFAULT_LAST_GET_TTL;
        }
        self
    }
}

/// Typed handle returned by registration and used for every lookup.
pub struct TypeKey<T> {
    name: Arc<str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypeKey<T> {
    pub(crate) fn new(name: Arc<str>) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for TypeKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for TypeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeKey").field(&self.name).finish()
    }
}

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;
pub(crate) type AnyRequest = Arc<dyn Any + Send + Sync>;

#[async_trait]
pub(crate) trait ErasedType: Send + Sync {
    async fn fetch(
        &self,
        opts: FetchOptions<AnyValue>,
        req: AnyRequest,
    ) -> Result<FetchResult<AnyValue>, CacheError>;
}

/// Adapts a typed [`CacheType`] to the erased form stored in the registry.
pub(crate) struct Erased<T> {
    name: Arc<str>,
    inner: T,
}

impl<T> Erased<T> {
    pub(crate) fn new(name: Arc<str>, inner: T) -> Self {
        Self { name, inner }
    }
}

#[async_trait]
impl<T: CacheType> ErasedType for Erased<T> {
    async fn fetch(
        &self,
        opts: FetchOptions<AnyValue>,
        req: AnyRequest,
    ) -> Result<FetchResult<AnyValue>, CacheError> {
        let req = req
            .downcast_ref::<T::Request>()
            .cloned()
            .ok_or_else(|| CacheError::WrongRequestType {
                type_name: self.name.to_string(),
            })?;

        let last_result = opts.last_result.map(|last| FetchResult {
            value: last
                .value
                .and_then(|v| v.downcast_ref::<T::Value>().cloned()),
            state: last.state,
            index: last.index,
            not_modified: last.not_modified,
        });
        let typed = FetchOptions {
            min_index: opts.min_index,
            timeout: opts.timeout,
            last_result,
        };

        let result = self.inner.fetch(typed, req).await?;
        Ok(FetchResult {
            value: result.value.map(|v| Arc::new(v) as AnyValue),
            state: result.state,
            index: result.index,
            not_modified: result.not_modified,
        })
    }
}

/// Registry record for one type.
#[derive(Clone)]
pub(crate) struct TypeEntry {
    pub name: Arc<str>,
    pub typ: Arc<dyn ErasedType>,
    pub opts: RegisterOptions,
}

pub(crate) fn downcast_value<V: Clone + 'static>(
    type_name: &str,
    value: Option<AnyValue>,
) -> Result<Option<V>, CacheError> {
    value
        .map(|v| {
            v.downcast_ref::<V>()
                .cloned()
                .ok_or_else(|| CacheError::WrongValueType {
                    type_name: type_name.to_string(),
                })
        })
        .transpose()
}
