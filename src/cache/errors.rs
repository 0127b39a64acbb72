use std::sync::Arc;

/// Errors surfaced by [`Cache`](super::Cache) operations.
///
/// Cloneable because a single fetch failure is stored on the entry and handed
/// to every caller that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("unknown type in cache: {0}")]
    UnknownType(String),

    #[error("request type does not match registered type {type_name}")]
    WrongRequestType { type_name: String },

    #[error("cached value for {type_name} has an unexpected type")]
    WrongValueType { type_name: String },

    #[error("Cannot use Notify for polling cache types without specifying the MaxAge")]
    MissingMaxAge,

    #[error("{0:#}")]
    Fetch(Arc<anyhow::Error>),

    #[error("fetch rate limiter closed")]
    RateLimiterClosed,

    #[error("request cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn fetch(err: anyhow::Error) -> Self {
        Self::Fetch(Arc::new(err))
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::fetch(err)
    }
}
