//! Agent-side caching: a read-through cache with single-flight fetches,
//! blocking index queries, background refresh and idle expiry, plus
//! materialized views fed by event streams and served through the same cache.

pub mod cache;
pub mod cli;
pub mod config;
pub mod demo;
pub mod logging;
pub mod retry;
pub mod stream;
pub mod utils;
pub mod views;
pub mod waiter;
