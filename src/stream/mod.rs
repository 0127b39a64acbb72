//! Event-stream subscriptions materialized into cacheable views.
//!
//! A subscription first delivers a snapshot of current state terminated by a
//! marker event, then incremental updates. A [`Materializer`] folds those
//! events into a [`View`], and [`StreamingType`] plugs materializers into the
//! cache as a blocking type.

mod cache_type;
mod materializer;
mod memory;

pub use cache_type::{StreamingType, ViewFactory};
pub use materializer::{Materializer, MaterializerError, View, ViewDeps};
pub use memory::QueueStreamClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload<P> {
    /// Marks the end of the initial snapshot.
    EndOfSnapshot,
    /// Sent instead of a snapshot when resuming from an index that is still
    /// current; nothing to apply.
    EndOfEmptySnapshot,
    /// The server is about to resend a full snapshot. Local state must be
    /// discarded.
    NewSnapshotToFollow,
    Update(P),
    /// Several updates sharing one index.
    Batch(Vec<P>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent<P> {
    pub index: u64,
    pub topic: String,
    pub payload: Payload<P>,
}

impl<P> StreamEvent<P> {
    pub fn new(index: u64, payload: Payload<P>) -> Self {
        Self {
            index,
            topic: String::new(),
            payload,
        }
    }

    pub fn update(index: u64, payload: P) -> Self {
        Self::new(index, Payload::Update(payload))
    }

    pub fn batch(index: u64, payloads: Vec<P>) -> Self {
        Self::new(index, Payload::Batch(payloads))
    }

    pub fn end_of_snapshot(index: u64) -> Self {
        Self::new(index, Payload::EndOfSnapshot)
    }

    pub fn end_of_empty_snapshot(index: u64) -> Self {
        Self::new(index, Payload::EndOfEmptySnapshot)
    }

    pub fn new_snapshot_to_follow() -> Self {
        Self::new(0, Payload::NewSnapshotToFollow)
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }
}

/// Parameters for opening a subscription. `index` is the last index the
/// subscriber has applied; zero requests a full snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub topic: String,
    pub key: String,
    pub token: String,
    pub datacenter: String,
    pub index: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The server dropped our subscription state; resubscribe from scratch.
    #[error("subscription reset by server")]
    Reset,

    /// Worth retrying without telling readers, e.g. a dropped connection.
    #[error("temporary stream error: {0:#}")]
    Temporary(anyhow::Error),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),

    /// Events arrived in an order that cannot be applied.
    #[error("stream desynchronized: {0}")]
    Desync(&'static str),

    #[error("failed to apply events to view: {0:#}")]
    View(anyhow::Error),

    #[error("subscription cancelled")]
    Cancelled,
}

impl SubscribeError {
    /// Temporary errors are retried without being shown to readers until the
    /// retry itself starts failing.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_) | Self::Reset | Self::Cancelled)
    }
}

pub type EventStream<P> = BoxStream<'static, Result<StreamEvent<P>, SubscribeError>>;

#[async_trait]
pub trait StreamingClient<P>: Send + Sync + 'static {
    async fn subscribe(
        &self,
        req: SubscribeRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream<P>, SubscribeError>;
}
