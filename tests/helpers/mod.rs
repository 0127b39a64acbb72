#![allow(dead_code)]

use agentcache::cache::{
    CacheType, EntryState, FetchOptions, FetchResult, RegisterOptions, Request, RequestInfo,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A request that carries its cache info verbatim.
#[derive(Debug, Clone, Default)]
pub struct TestRequest(pub RequestInfo);

impl TestRequest {
    pub fn key(key: &str) -> Self {
        Self(RequestInfo {
            key: key.to_owned(),
            ..Default::default()
        })
    }

    pub fn min_index(mut self, index: u64) -> Self {
        self.0.min_index = index;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.0.timeout = timeout;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.0.max_age = max_age;
        self
    }

    pub fn must_revalidate(mut self) -> Self {
        self.0.must_revalidate = true;
        self
    }

    pub fn datacenter(mut self, dc: &str) -> Self {
        self.0.datacenter = dc.to_owned();
        self
    }

    pub fn token(mut self, token: &str) -> Self {
        self.0.token = token.to_owned();
        self
    }
}

impl Request for TestRequest {
    fn cache_info(&self) -> RequestInfo {
        self.0.clone()
    }
}

/// One recorded call into a [`StubType`].
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub key: String,
    pub min_index: u64,
    pub timeout: Duration,
    pub last_index: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<FetchCall>>>);

impl Calls {
    fn record<V>(&self, opts: &FetchOptions<V>, req: &TestRequest) -> u64 {
        let mut calls = self.0.lock();
        calls.push(FetchCall {
            key: req.0.key.clone(),
            min_index: opts.min_index,
            timeout: opts.timeout,
            last_index: opts.last_result.as_ref().map(|r| r.index),
        });
        calls.len() as u64
    }

    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn get(&self, n: usize) -> FetchCall {
        self.0.lock()[n].clone()
    }
}

type Handler<V> = Box<
    dyn Fn(u64, FetchOptions<V>, TestRequest) -> BoxFuture<'static, anyhow::Result<FetchResult<V>>>
        + Send
        + Sync,
>;

/// A cache type driven by a closure. The closure receives the 1-based call
/// number along with the fetch options and request.
pub struct StubType<V> {
    calls: Calls,
    handler: Handler<V>,
}

impl<V: Send + 'static> StubType<V> {
    pub fn new<F, Fut>(handler: F) -> (Self, Calls)
    where
        F: Fn(u64, FetchOptions<V>, TestRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FetchResult<V>>> + Send + 'static,
    {
        let calls = Calls::default();
        let stub = Self {
            calls: calls.clone(),
            handler: Box::new(move |n, opts, req| Box::pin(handler(n, opts, req))),
        };
        (stub, calls)
    }
}

#[async_trait]
impl<V: Clone + PartialEq + Send + Sync + 'static> CacheType for StubType<V> {
    type Request = TestRequest;
    type Value = V;

    async fn fetch(
        &self,
        opts: FetchOptions<V>,
        req: TestRequest,
    ) -> anyhow::Result<FetchResult<V>> {
        let n = self.calls.record(&opts, &req);
        (self.handler)(n, opts, req).await
    }
}

/// Entry state that records whether the cache closed it.
#[derive(Debug, Default)]
pub struct ClosedFlag(AtomicBool);

impl ClosedFlag {
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl EntryState for ClosedFlag {
    fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub fn plain() -> RegisterOptions {
    RegisterOptions::default()
}

pub fn blocking() -> RegisterOptions {
    RegisterOptions {
        supports_blocking: true,
        ..Default::default()
    }
}

pub fn refreshing(timer: Duration) -> RegisterOptions {
    RegisterOptions {
        refresh: true,
        refresh_timer: timer,
        ..Default::default()
    }
}
