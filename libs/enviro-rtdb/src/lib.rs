//! EnviroDAS cache-tier abstraction
//!
//! Provides a unified interface over the low-latency store holding the
//! realtime snapshot, bounded history and per-sensor time series.
//!
//! # Key components
//!
//! - **Cache trait**: hash/list/sorted-set operations plus pipelined batches
//! - **RedisCache**: production Redis backend
//! - **MemoryCache**: in-memory backend for hermetic tests
//! - **WriteBuffer**: fire-and-forget op batching with size/interval flush

pub mod memory_impl;
pub mod redis_impl;
pub mod traits;
pub mod write_buffer;

// Canonical keyspace lives in enviro-model; re-exported here so storage
// users need only this crate.
pub use enviro_model::keyspace::{parse_key, DataKind, KeySpace, ParsedKey};

pub use bytes::Bytes;
pub use memory_impl::MemoryCache;
pub use redis_impl::RedisCache;
pub use traits::{Cache, CacheOp};
pub use write_buffer::{WriteBuffer, WriteBufferConfig, WriteBufferStatsSnapshot};

use std::sync::Arc;

/// In-memory cache for unit tests; no external services required.
pub fn create_test_cache() -> Arc<MemoryCache> {
    Arc::new(MemoryCache::new())
}
