//! One-shot broadcast latch.
//!
//! A `Waiter` represents a single generation of "something changed". Readers
//! clone it and wait; the writer fires it exactly once and installs a fresh
//! one for the next generation. Firing is idempotent and wakes every clone.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Waiter {
    token: CancellationToken,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A waiter that has already fired. Waiting on it returns immediately.
    pub fn fired() -> Self {
        let waiter = Self::new();
        waiter.fire();
        waiter
    }

    pub fn fire(&self) {
        self.token.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this generation has fired.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}
