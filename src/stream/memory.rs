use super::{EventStream, StreamEvent, StreamingClient, SubscribeError, SubscribeRequest};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Item<P> = Result<StreamEvent<P>, SubscribeError>;
type SharedReceiver<P> = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Item<P>>>>;

struct Queue<P> {
    tx: mpsc::UnboundedSender<Item<P>>,
    rx: SharedReceiver<P>,
}

impl<P> Queue<P> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

struct Queues<P> {
    by_key: HashMap<String, Queue<P>>,
    requests: Vec<SubscribeRequest>,
}

impl<P> Queues<P> {
    fn get(&mut self, key: &str) -> &Queue<P> {
        self.by_key.entry(key.to_string()).or_insert_with(Queue::new)
    }
}

/// In-memory [`StreamingClient`] fed by hand.
///
/// Events and errors are queued per subscription key. A subscriber drains
/// its key's queue in order; after it disconnects, the next subscriber for
/// the same key continues where it left off.
pub struct QueueStreamClient<P> {
    inner: Arc<Mutex<Queues<P>>>,
}

impl<P> Clone for QueueStreamClient<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P> Default for QueueStreamClient<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> QueueStreamClient<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Queues {
                by_key: HashMap::new(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn queue_events(&self, key: &str, events: impl IntoIterator<Item = StreamEvent<P>>) {
        let mut queues = self.inner.lock();
        let queue = queues.get(key);
        for event in events {
            // The receiver lives as long as the queue, so sends cannot fail.
            let _ = queue.tx.send(Ok(event));
        }
    }

    pub fn queue_err(&self, key: &str, err: SubscribeError) {
        let _ = self.inner.lock().get(key).tx.send(Err(err));
    }

    /// Every subscribe request served so far, oldest first.
    pub fn requests(&self) -> Vec<SubscribeRequest> {
        self.inner.lock().requests.clone()
    }
}

#[async_trait]
impl<P: Send + 'static> StreamingClient<P> for QueueStreamClient<P> {
    async fn subscribe(
        &self,
        req: SubscribeRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream<P>, SubscribeError> {
        let rx = {
            let mut queues = self.inner.lock();
            queues.requests.push(req.clone());
            queues.get(&req.key).rx.clone()
        };

        let stream = futures::stream::unfold((rx, cancel), |(rx, cancel)| async move {
            let item = {
                let mut receiver = tokio::select! {
                    receiver = rx.lock() => receiver,
                    _ = cancel.cancelled() => return None,
                };
                tokio::select! {
                    item = receiver.recv() => item,
                    _ = cancel.cancelled() => None,
                }
            };
            item.map(|item| (item, (rx, cancel)))
        });
        Ok(stream.boxed())
    }
}
