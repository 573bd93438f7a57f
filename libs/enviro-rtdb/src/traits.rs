//! Cache trait definitions

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// One buffered cache mutation, applied through a pipeline.
///
/// Each variant bundles the write with its bound so a batch can never leave
/// a key unbounded, whatever order the pipeline lands in.
#[derive(Debug, Clone)]
pub enum CacheOp {
    /// HSET all fields, optionally refreshing a TTL.
    HashSetAll {
        key: String,
        fields: Vec<(String, Bytes)>,
        ttl_secs: Option<i64>,
    },
    /// LPUSH newest-at-head, then LTRIM to `max_len`.
    ListPushTrim {
        key: String,
        value: Bytes,
        max_len: usize,
    },
    /// ZADD, then drop lowest-ranked members beyond `max_len`.
    ZSetAddTrim {
        key: String,
        score: f64,
        member: String,
        max_len: usize,
    },
}

/// Unified cache-tier storage trait.
///
/// Implementations:
/// - `RedisCache`: production Redis backend
/// - `MemoryCache`: in-memory backend for testing
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Liveness probe; used for fail-fast startup.
    async fn ping(&self) -> Result<()>;

    // ========== Hash operations ==========

    async fn hash_set_all(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>>;

    /// Set a key TTL in seconds.
    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()>;

    // ========== List operations ==========

    async fn list_lpush(&self, key: &str, value: Bytes) -> Result<()>;

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    /// LRANGE; `stop` is inclusive, negative indices count from the tail.
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    // ========== Sorted-set operations ==========

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<()>;

    /// Remove members by ascending rank range (ZREMRANGEBYRANK semantics).
    async fn zset_remove_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    /// Members with `score > min` (or `>= min` when `inclusive`), ascending,
    /// at most `limit` entries.
    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        inclusive: bool,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    async fn zset_len(&self, key: &str) -> Result<usize>;

    // ========== Key operations ==========

    /// SCAN with a glob pattern.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>>;

    async fn del(&self, key: &str) -> Result<bool>;

    // ========== Batched writes ==========

    /// Apply a batch of ops in one round trip where the backend allows.
    async fn apply(&self, ops: Vec<CacheOp>) -> Result<()>;
}
