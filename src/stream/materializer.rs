//! Folds a subscription's event stream into a [`View`] and serves it with
//! blocking-read semantics.

use super::{Payload, StreamingClient, SubscribeError, SubscribeRequest};
use crate::cache::{EntryState, FetchOptions, FetchResult};
use crate::retry::RetryWaiter;
use crate::utils::fmt_duration;
use crate::waiter::Waiter;
use anyhow::anyhow;
use futures::StreamExt;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Reduction state for one subscription.
///
/// `update` may see the same snapshot applied again after a reconnect and
/// must tolerate it.
pub trait View: Send + 'static {
    type Event: Send + 'static;
    type Value: Clone + PartialEq + Send + Sync + 'static;

    fn update(&mut self, events: Vec<Self::Event>) -> anyhow::Result<()>;

    /// Materializes the current state, stamped with `index`.
    fn result(&self, index: u64) -> anyhow::Result<Self::Value>;

    fn reset(&mut self);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MaterializerError {
    #[error(transparent)]
    Stream(Arc<SubscribeError>),

    #[error("view error: {0:#}")]
    View(Arc<anyhow::Error>),

    #[error("materializer closed")]
    Closed,
}

impl From<SubscribeError> for MaterializerError {
    fn from(err: SubscribeError) -> Self {
        Self::Stream(Arc::new(err))
    }
}

pub struct ViewDeps<V: View> {
    pub view: V,
    pub client: Arc<dyn StreamingClient<V::Event>>,
    pub retry: RetryWaiter,
    /// Builds the subscribe request for a resume index.
    pub request: Box<dyn Fn(u64) -> SubscribeRequest + Send + Sync>,
    /// Invoked once when the materializer is closed.
    pub on_close: Option<Box<dyn Fn() + Send + Sync>>,
}

struct ViewState<V> {
    view: V,
    index: u64,
    snapshot_done: bool,
    updated: Waiter,
    err: Option<MaterializerError>,
    retry: RetryWaiter,
}

impl<V: View> ViewState<V> {
    fn reset(&mut self) {
        self.view.reset();
        self.index = 0;
        self.snapshot_done = false;
    }

    /// Starts a new generation, waking every blocked fetch.
    fn publish(&mut self, err: Option<MaterializerError>) {
        self.err = err;
        std::mem::replace(&mut self.updated, Waiter::new()).fire();
    }

    fn applied(&mut self, index: u64) {
        self.index = index;
        self.retry.reset();
        self.publish(None);
    }
}

pub struct Materializer<V: View> {
    state: Mutex<ViewState<V>>,
    client: Arc<dyn StreamingClient<V::Event>>,
    request: Box<dyn Fn(u64) -> SubscribeRequest + Send + Sync>,
    on_close: Option<Box<dyn Fn() + Send + Sync>>,
    done: CancellationToken,
}

impl<V: View> Materializer<V> {
    pub fn new(deps: ViewDeps<V>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ViewState {
                view: deps.view,
                index: 0,
                snapshot_done: false,
                updated: Waiter::new(),
                err: None,
                retry: deps.retry,
            }),
            client: deps.client,
            request: deps.request,
            on_close: deps.on_close,
            done: CancellationToken::new(),
        })
    }

    /// Index of the last applied snapshot or event. Zero until the first
    /// snapshot completes.
    pub fn index(&self) -> u64 {
        self.state.lock().index
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Stops the subscription loop and wakes blocked fetches. Idempotent.
    pub fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        if let Some(on_close) = &self.on_close {
            on_close();
        }
    }

    /// Subscribes and keeps the view current until closed, reconnecting with
    /// backoff after failures.
    pub async fn run(self: Arc<Self>) {
        loop {
            let err = self.run_subscription().await;
            if self.done.is_cancelled() {
                break;
            }

            let (wait, failures) = {
                let mut state = self.state.lock();
                // The first temporary failure is retried quietly; readers keep
                // the last good result.
                if !err.is_temporary() || state.retry.failures() > 0 {
                    state.publish(Some(err.into()));
                }
                let wait = state.retry.failed();
                (wait, state.retry.failures())
            };
            error!(failures, wait = fmt_duration(wait), "subscription failed, retrying");

            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.done.cancelled() => break,
            }
        }
        debug!("materializer stopped");
    }

    async fn run_subscription(&self) -> SubscribeError {
        let index = self.state.lock().index;
        let req = (self.request)(index);
        let cancel = self.done.child_token();
        let _cancel_on_exit = cancel.clone().drop_guard();

        let mut stream = match self.client.subscribe(req, cancel).await {
            Ok(stream) => stream,
            Err(err) => return err,
        };
        trace!(index, "subscribed");

        let mut snapshot: Vec<V::Event> = Vec::new();
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = self.done.cancelled() => return SubscribeError::Cancelled,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(SubscribeError::Reset)) => {
                    self.state.lock().reset();
                    return SubscribeError::Reset;
                }
                Some(Err(err)) => return err,
                None => return SubscribeError::Temporary(anyhow!("stream closed by server")),
            };

            let index = event.index;
            let events = match event.payload {
                Payload::EndOfSnapshot => {
                    let mut state = self.state.lock();
                    if let Err(err) = state.view.update(std::mem::take(&mut snapshot)) {
                        state.reset();
                        return SubscribeError::View(err);
                    }
                    state.snapshot_done = true;
                    state.applied(index);
                    debug!(index, "snapshot applied");
                    continue;
                }
                Payload::EndOfEmptySnapshot => {
                    let mut state = self.state.lock();
                    if !state.snapshot_done {
                        state.reset();
                        return SubscribeError::Desync("empty snapshot without a local snapshot");
                    }
                    state.retry.reset();
                    state.publish(None);
                    trace!(index = state.index, "resumed without a new snapshot");
                    continue;
                }
                Payload::NewSnapshotToFollow => {
                    self.state.lock().reset();
                    snapshot.clear();
                    continue;
                }
                Payload::Update(payload) => vec![payload],
                Payload::Batch(payloads) => payloads,
            };

            let mut state = self.state.lock();
            if !state.snapshot_done {
                snapshot.extend(events);
                continue;
            }
            if let Err(err) = state.view.update(events) {
                state.reset();
                return SubscribeError::View(err);
            }
            state.applied(index);
        }
    }

    /// Returns the view once its index exceeds `opts.min_index`.
    ///
    /// Waits for updates until then. On timeout the current result is
    /// returned without an error. A published stream error fails a fetch
    /// that would otherwise have to wait.
    pub async fn fetch(
        &self,
        opts: FetchOptions<V::Value>,
    ) -> Result<FetchResult<V::Value>, MaterializerError> {
        let (mut result, mut updated) = {
            let state = self.state.lock();
            let value = view_result(&state)?;
            let result = FetchResult::new(value, state.index);
            if result.index > 0 && result.index > opts.min_index {
                return Ok(result);
            }
            if let Some(err) = &state.err {
                return Err(err.clone());
            }
            (result, state.updated.clone())
        };

        let deadline = Instant::now() + opts.timeout;
        loop {
            tokio::select! {
                _ = updated.wait() => {}
                _ = sleep_until(deadline) => return Ok(result),
                _ = self.done.cancelled() => return Err(MaterializerError::Closed),
            }

            {
                let state = self.state.lock();
                if let Some(err) = &state.err {
                    return Err(err.clone());
                }
                result = FetchResult::new(view_result(&state)?, state.index);
                updated = state.updated.clone();
            }
            if result.index > opts.min_index {
                return Ok(result);
            }
        }
    }
}

fn view_result<V: View>(state: &ViewState<V>) -> Result<V::Value, MaterializerError> {
    state
        .view
        .result(state.index)
        .map_err(|e| MaterializerError::View(Arc::new(e)))
}

impl<V: View> EntryState for Materializer<V> {
    fn close(&self) {
        Materializer::close(self);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
