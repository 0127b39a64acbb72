//! Serves materialized views through the cache as a blocking type.

use super::materializer::{Materializer, View, ViewDeps};
use super::{StreamingClient, SubscribeRequest};
use crate::cache::{
    CacheType, DEFAULT_QUERY_TIMEOUT, EntryState, FetchOptions, FetchResult, RegisterOptions,
    Request,
};
use crate::retry::RetryWaiter;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Builds the view and subscription for a request.
pub trait ViewFactory: Send + Sync + 'static {
    type Request: Request;
    type View: View;

    fn new_view(&self, req: &Self::Request) -> anyhow::Result<Self::View>;

    fn subscribe_request(&self, req: &Self::Request, index: u64) -> SubscribeRequest;
}

type Views<V> = DashMap<String, Arc<Materializer<V>>>;

/// A [`CacheType`] whose fetches are answered by a long-lived
/// [`Materializer`] per request key.
///
/// The materializer is attached to the cache entry as its state, so it is
/// found again on the next fetch and closed when the entry is evicted.
pub struct StreamingType<F: ViewFactory> {
    factory: Arc<F>,
    client: Arc<dyn StreamingClient<<F::View as View>::Event>>,
    retry: RetryWaiter,
    views: Arc<Views<F::View>>,
}

impl<F: ViewFactory> StreamingType<F> {
    pub fn new(factory: F, client: Arc<dyn StreamingClient<<F::View as View>::Event>>) -> Self {
        Self {
            factory: Arc::new(factory),
            client,
            retry: RetryWaiter::default(),
            views: Arc::new(DashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryWaiter) -> Self {
        self.retry = retry;
        self
    }

    /// Registration options streaming types need: blocking reads kept fresh by
    /// the materializer itself.
    pub fn register_options() -> RegisterOptions {
        RegisterOptions {
            refresh: true,
            supports_blocking: true,
            refresh_timer: std::time::Duration::ZERO,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            ..Default::default()
        }
    }

    /// Number of running materializers.
    pub fn active_views(&self) -> usize {
        self.views.len()
    }

    fn view_key(req: &F::Request) -> String {
        let info = req.cache_info();
        format!(
            "{}/{}/{}/{}",
            info.datacenter, info.peer_name, info.token, info.key
        )
    }

    fn materializer_for(&self, req: &F::Request) -> anyhow::Result<Arc<Materializer<F::View>>> {
        let key = Self::view_key(req);
        if let Some(existing) = self.views.get(&key).filter(|m| !m.is_closed()) {
            return Ok(existing.clone());
        }

        let view = self.factory.new_view(req)?;
        let factory = self.factory.clone();
        let request = req.clone();
        let views: Weak<Views<F::View>> = Arc::downgrade(&self.views);
        let close_key = key.clone();

        let created = Materializer::new(ViewDeps {
            view,
            client: self.client.clone(),
            retry: self.retry.clone(),
            request: Box::new(move |index| factory.subscribe_request(&request, index)),
            on_close: Some(Box::new(move || {
                if let Some(views) = views.upgrade() {
                    views.remove_if(&close_key, |_, m| m.is_closed());
                }
            })),
        });

        // Another fetch may have raced us to the same key; only the winner runs.
        let chosen = self
            .views
            .entry(key.clone())
            .and_modify(|current| {
                if current.is_closed() {
                    *current = created.clone();
                }
            })
            .or_insert_with(|| created.clone())
            .clone();

        if Arc::ptr_eq(&chosen, &created) {
            debug!(view = %key, "starting materialized view");
            tokio::spawn(chosen.clone().run());
        }
        Ok(chosen)
    }
}

impl<F: ViewFactory> Drop for StreamingType<F> {
    fn drop(&mut self) {
        let running: Vec<_> = self.views.iter().map(|m| m.value().clone()).collect();
        for materializer in running {
            materializer.close();
        }
    }
}

#[async_trait]
impl<F: ViewFactory> CacheType for StreamingType<F> {
    type Request = F::Request;
    type Value = <F::View as View>::Value;

    async fn fetch(
        &self,
        opts: FetchOptions<Self::Value>,
        req: Self::Request,
    ) -> anyhow::Result<FetchResult<Self::Value>> {
        let attached = opts
            .last_result
            .as_ref()
            .and_then(|last| last.state.clone())
            .and_then(|state| state.as_any().downcast::<Materializer<F::View>>().ok())
            .filter(|m| !m.is_closed());
        let materializer = match attached {
            Some(materializer) => materializer,
            None => self.materializer_for(&req)?,
        };

        let view_opts = FetchOptions {
            min_index: opts.min_index,
            timeout: opts.timeout,
            last_result: None,
        };
        let result = materializer.fetch(view_opts).await?;
        Ok(result.with_state(materializer as Arc<dyn EntryState>))
    }
}
