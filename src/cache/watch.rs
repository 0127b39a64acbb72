//! Change notification on top of [`Cache::get`].
//!
//! A watch runs a background loop that repeatedly reads through the cache and
//! invokes a callback whenever the result changes. Blocking types are watched
//! with long-polls on `min_index`; other types are re-read on a timer derived
//! from the request's `max_age`.

use super::fetch::{REFRESH_BACKOFF_MIN, backoff_wait};
use super::types::{CacheType, TypeKey, downcast_value};
use super::{Cache, CacheError, GetRequest, ResultMeta};
use crate::utils::random_stagger;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A change delivered to a watcher.
#[derive(Debug, Clone)]
pub struct UpdateEvent<V> {
    /// Caller-supplied tag used to tell watches apart on a shared channel.
    pub correlation_id: String,
    pub result: Option<V>,
    pub meta: ResultMeta,
    pub err: Option<CacheError>,
}

type BoxedDelivery = Pin<Box<dyn Future<Output = ()> + Send>>;
type Callback<V> = Arc<dyn Fn(UpdateEvent<V>) -> BoxedDelivery + Send + Sync>;

impl Cache {
    /// Watches `req` and sends every change to `tx` until `cancel` fires.
    ///
    /// Polling types require `max_age` to be set on the request.
    pub fn notify<T: CacheType>(
        &self,
        cancel: CancellationToken,
        typ: &TypeKey<T>,
        req: T::Request,
        correlation_id: impl Into<String>,
        tx: mpsc::Sender<UpdateEvent<T::Value>>,
    ) -> Result<(), CacheError> {
        let send_cancel = cancel.clone();
        self.notify_callback(cancel, typ, req, correlation_id, move |event| {
            let tx = tx.clone();
            let cancel = send_cancel.clone();
            async move {
                tokio::select! {
                    _ = tx.send(event) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        })
    }

    /// Like [`Cache::notify`], but invokes `callback` for each change. The
    /// loop waits for the callback to finish before reading again.
    pub fn notify_callback<T, F, Fut>(
        &self,
        cancel: CancellationToken,
        typ: &TypeKey<T>,
        req: T::Request,
        correlation_id: impl Into<String>,
        callback: F,
    ) -> Result<(), CacheError>
    where
        T: CacheType,
        F: Fn(UpdateEvent<T::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let req = self.resolve(typ.name(), req)?;
        let callback: Callback<T::Value> =
            Arc::new(move |event| -> BoxedDelivery { Box::pin(callback(event)) });
        let watch = Watch {
            cache: self.clone(),
            cancel,
            type_name: typ.name().to_string(),
            correlation_id: correlation_id.into(),
            callback,
        };

        if req.type_entry.opts.supports_blocking {
            tokio::spawn(watch.run_blocking(req));
        } else {
            if req.info.max_age.is_zero() {
                return Err(CacheError::MissingMaxAge);
            }
            tokio::spawn(watch.run_polling(req));
        }
        Ok(())
    }
}

struct Watch<V> {
    cache: Cache,
    cancel: CancellationToken,
    type_name: String,
    correlation_id: String,
    callback: Callback<V>,
}

impl<V: Clone + PartialEq + Send + Sync + 'static> Watch<V> {
    async fn get(&self, req: GetRequest) -> Result<(Option<V>, ResultMeta), CacheError> {
        let (value, meta) = self
            .cache
            .get_with_index(&self.cancel, req)
            .await
            .map_err(|e| e.err)?;
        Ok((downcast_value(&self.type_name, value)?, meta))
    }

    async fn deliver(&self, result: Option<V>, meta: ResultMeta) {
        let event = UpdateEvent {
            correlation_id: self.correlation_id.clone(),
            result,
            meta,
            err: None,
        };
        (self.callback)(event).await;
    }

    /// Logs a failed read. Once retries start backing off the error is also
    /// delivered, a single time per failure streak.
    async fn failed(&self, failures: u32, err: CacheError) {
        warn!(
            correlation_id = %self.correlation_id,
            failures,
            error = %err,
            "watch read failed"
        );
        if failures == REFRESH_BACKOFF_MIN + 1 {
            let event = UpdateEvent {
                correlation_id: self.correlation_id.clone(),
                result: None,
                meta: ResultMeta::default(),
                err: Some(err),
            };
            (self.callback)(event).await;
        }
    }

    /// Sleeps for `wait`, returning `false` if the watch was cancelled.
    async fn pause(&self, wait: Duration) -> bool {
        if wait.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = sleep(wait) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn run_blocking(self, mut req: GetRequest) {
        let mut index: Option<u64> = None;
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = self.get(req.clone()).await;
            if self.cancel.is_cancelled() {
                break;
            }

            let mut wait = Duration::ZERO;
            match result {
                Ok((value, meta)) => {
                    if index.is_none_or(|seen| meta.index > seen) {
                        self.deliver(value, meta).await;
                        index = Some(meta.index);
                    }
                    failures = 0;
                }
                Err(err) => {
                    failures += 1;
                    wait = backoff_wait(failures);
                    self.failed(failures, err).await;
                }
            }

            if !self.pause(wait).await {
                break;
            }
            // Never long-poll with zero; that would return immediately.
            req.info.min_index = index.unwrap_or(0).max(1);
        }
        debug!(correlation_id = %self.correlation_id, "blocking watch stopped");
    }

    async fn run_polling(self, req: GetRequest) {
        let max_age = req.info.max_age;
        let mut last: Option<(Option<V>, u64)> = None;
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = self.get(req.clone()).await;
            if self.cancel.is_cancelled() {
                break;
            }

            let wait = match result {
                Ok((value, meta)) => {
                    failures = 0;
                    let changed = match &last {
                        None => true,
                        Some((last_value, last_index)) => {
                            meta.index != *last_index || *last_value != value
                        }
                    };
                    if changed {
                        self.deliver(value.clone(), meta).await;
                        last = Some((value, meta.index));
                    }

                    // Re-read once the value we just got would exceed max_age,
                    // staggered so watchers of one key do not fire together.
                    let remaining = max_age.saturating_sub(meta.age);
                    remaining + random_stagger(max_age / 16)
                }
                Err(err) => {
                    failures += 1;
                    self.failed(failures, err).await;
                    backoff_wait(failures)
                }
            };

            if !self.pause(wait).await {
                break;
            }
        }
        debug!(correlation_id = %self.correlation_id, "polling watch stopped");
    }
}
