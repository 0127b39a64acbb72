//! Min-heap of entry expiry deadlines.
//!
//! Every cached entry owns an [`ExpiryEntry`] handle. The handle tracks its
//! own position in the heap so reads can push the deadline out in
//! `O(log n)` without searching. The background reaper sleeps until the
//! deadline at the top of the heap and is woken through [`Notify`] whenever
//! that position changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const NOT_INDEXED: usize = usize::MAX;

#[derive(Debug)]
pub struct ExpiryEntry<K> {
    key: K,
    index: AtomicUsize,
}

impl<K> ExpiryEntry<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Current heap position, or `None` once removed.
    pub fn index(&self) -> Option<usize> {
        match self.index.load(Ordering::Acquire) {
            NOT_INDEXED => None,
            idx => Some(idx),
        }
    }

    fn set_index(&self, idx: usize) {
        self.index.store(idx, Ordering::Release);
    }
}

#[derive(Debug)]
struct Node<K> {
    expires: Instant,
    entry: Arc<ExpiryEntry<K>>,
}

/// The earliest deadline in the heap.
#[derive(Debug, Clone)]
pub struct NextExpiry<K> {
    pub expires: Instant,
    pub entry: Arc<ExpiryEntry<K>>,
}

#[derive(Debug)]
pub struct ExpiryHeap<K> {
    nodes: Vec<Node<K>>,
    notify: Arc<Notify>,
}

impl<K> Default for ExpiryHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ExpiryHeap<K> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever the head of the heap changes.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add(&mut self, key: K, ttl: Duration) -> Arc<ExpiryEntry<K>> {
        let idx = self.nodes.len();
        let entry = Arc::new(ExpiryEntry {
            key,
            index: AtomicUsize::new(idx),
        });
        self.nodes.push(Node {
            expires: Instant::now() + ttl,
            entry: entry.clone(),
        });

        if self.sift_up(idx) == 0 {
            self.notify.notify_one();
        }
        entry
    }

    /// Moves the deadline of `entry` to `now + ttl`.
    pub fn update(&mut self, entry: &ExpiryEntry<K>, ttl: Duration) {
        let Some(idx) = self.position(entry) else {
            return;
        };
        self.nodes[idx].expires = Instant::now() + ttl;
        let new_idx = self.fix(idx);
        if idx == 0 || new_idx == 0 {
            self.notify.notify_one();
        }
    }

    pub fn remove(&mut self, entry: &ExpiryEntry<K>) {
        let Some(idx) = self.position(entry) else {
            return;
        };

        let last = self.nodes.len() - 1;
        self.swap(idx, last);
        if let Some(removed) = self.nodes.pop() {
            removed.entry.set_index(NOT_INDEXED);
        }
        if idx < self.nodes.len() {
            self.fix(idx);
        }
        if idx == 0 {
            self.notify.notify_one();
        }
    }

    pub fn next(&self) -> Option<NextExpiry<K>> {
        self.nodes.first().map(|node| NextExpiry {
            expires: node.expires,
            entry: node.entry.clone(),
        })
    }

    /// Whether `entry` is still in the heap with a deadline at or before `now`.
    pub fn is_expired(&self, entry: &ExpiryEntry<K>, now: Instant) -> bool {
        self.position(entry)
            .is_some_and(|idx| self.nodes[idx].expires <= now)
    }

    fn position(&self, entry: &ExpiryEntry<K>) -> Option<usize> {
        let idx = entry.index()?;
        let node = self.nodes.get(idx)?;
        std::ptr::eq(node.entry.as_ref(), entry).then_some(idx)
    }

    fn fix(&mut self, idx: usize) -> usize {
        let moved = self.sift_up(idx);
        if moved != idx {
            return moved;
        }
        self.sift_down(idx)
    }

    fn sift_up(&mut self, mut idx: usize) -> usize {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.nodes[idx].expires >= self.nodes[parent].expires {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
        idx
    }

    fn sift_down(&mut self, mut idx: usize) -> usize {
        let len = self.nodes.len();
        loop {
            let left = 2 * idx + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.nodes[right].expires < self.nodes[left].expires {
                right
            } else {
                left
            };
            if self.nodes[child].expires >= self.nodes[idx].expires {
                break;
            }
            self.swap(idx, child);
            idx = child;
        }
        idx
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.nodes.swap(a, b);
        self.nodes[a].entry.set_index(a);
        self.nodes[b].entry.set_index(b);
    }
}
