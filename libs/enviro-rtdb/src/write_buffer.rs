//! Write buffer for batching cache operations
//!
//! Aggregates `CacheOp`s in memory and flushes them as one pipeline when
//! either the op budget fills or the flush interval elapses. Callers never
//! block on the cache; a failed flush increments an error counter and the
//! stream keeps moving.

use crate::traits::{Cache, CacheOp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Write buffer configuration
#[derive(Clone, Debug)]
pub struct WriteBufferConfig {
    /// Flush interval in milliseconds (default: 50 ms)
    pub flush_interval_ms: u64,
    /// Pipeline at most this many ops per flush trigger (default: 64)
    pub max_ops: usize,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            max_ops: 64,
        }
    }
}

/// Monitoring counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct WriteBufferStats {
    pub buffered_ops: AtomicU64,
    pub flush_count: AtomicU64,
    pub ops_flushed: AtomicU64,
    pub forced_flushes: AtomicU64,
    pub flush_errors: AtomicU64,
}

/// Consistent point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBufferStatsSnapshot {
    pub buffered_ops: u64,
    pub flush_count: u64,
    pub ops_flushed: u64,
    pub forced_flushes: u64,
    pub flush_errors: u64,
}

impl WriteBufferStats {
    pub fn snapshot(&self) -> WriteBufferStatsSnapshot {
        WriteBufferStatsSnapshot {
            buffered_ops: self.buffered_ops.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            ops_flushed: self.ops_flushed.load(Ordering::Relaxed),
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
        }
    }
}

/// Ordered op buffer with size/interval flush triggers.
///
/// Ops are flushed in arrival order, so per-sensor writes keep their
/// relative order through the pipeline.
pub struct WriteBuffer {
    pending: Mutex<Vec<CacheOp>>,
    flush_notify: Arc<Notify>,
    config: WriteBufferConfig,
    stats: WriteBufferStats,
}

impl WriteBuffer {
    pub fn new(config: WriteBufferConfig) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            flush_notify: Arc::new(Notify::new()),
            config,
            stats: WriteBufferStats::default(),
        }
    }

    pub fn stats(&self) -> &WriteBufferStats {
        &self.stats
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.lock().len()
    }

    /// Buffer one op (returns immediately).
    pub fn push(&self, op: CacheOp) {
        let len = {
            let mut pending = self.pending.lock();
            pending.push(op);
            pending.len()
        };
        self.stats.buffered_ops.fetch_add(1, Ordering::Relaxed);
        if len >= self.config.max_ops {
            self.stats.forced_flushes.fetch_add(1, Ordering::Relaxed);
            self.flush_notify.notify_one();
        }
    }

    /// Buffer several ops as one unit.
    pub fn push_all(&self, ops: Vec<CacheOp>) {
        if ops.is_empty() {
            return;
        }
        let count = ops.len() as u64;
        let len = {
            let mut pending = self.pending.lock();
            pending.extend(ops);
            pending.len()
        };
        self.stats.buffered_ops.fetch_add(count, Ordering::Relaxed);
        if len >= self.config.max_ops {
            self.stats.forced_flushes.fetch_add(1, Ordering::Relaxed);
            self.flush_notify.notify_one();
        }
    }

    fn drain_pending(&self) -> Vec<CacheOp> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Flush all pending ops; returns how many were written.
    pub async fn flush<C>(&self, cache: &C) -> anyhow::Result<usize>
    where
        C: Cache + ?Sized,
    {
        let ops = self.drain_pending();
        if ops.is_empty() {
            return Ok(0);
        }
        let count = ops.len();
        cache.apply(ops).await?;
        self.stats.flush_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .ops_flushed
            .fetch_add(count as u64, Ordering::Relaxed);
        tracing::trace!(ops = count, "write buffer flushed");
        Ok(count)
    }

    /// Background flush loop; performs a final flush on cancellation.
    pub async fn flush_loop<C>(&self, cache: &C, token: CancellationToken)
    where
        C: Cache + ?Sized,
    {
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    if let Err(e) = self.flush(cache).await {
                        tracing::warn!(error = %e, "final write buffer flush failed");
                        self.stats.flush_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
                _ = self.flush_notify.notified() => {}
            }

            if let Err(e) = self.flush(cache).await {
                tracing::warn!(error = %e, "write buffer flush failed");
                self.stats.flush_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::debug!("write buffer flush loop stopped");
    }
}
