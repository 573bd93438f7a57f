//! Realtime sync workers
//!
//! Four independent self-clocked workers, one per data kind. Each cycle
//! scans the cache for its key family, consults the ledgers, and upserts
//! whatever is strictly newer. All comparisons use timestamps stored in
//! the records themselves, so clock skew between the acquisition and sync
//! hosts cannot produce duplicates or gaps.

use crate::records;
use anyhow::{Context, Result};
use enviro_config::SyncConfig;
use enviro_model::{parse_key, DataKind, ParsedKey};
use enviro_rtdb::Cache;
use enviro_store::documents::{self, StatisticsSummary};
use enviro_store::DocStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// History list capacity; a list at this length may have been trimmed, so
/// incremental count tracking falls back to a full reconcile.
pub const HISTORY_MAX_LEN: usize = 1000;

/// Per-kind sync counters.
#[derive(Debug, Default)]
pub struct SyncStats {
    pub realtime_synced: AtomicU64,
    pub historical_synced: AtomicU64,
    pub timeseries_synced: AtomicU64,
    pub statistics_synced: AtomicU64,
    pub cycles: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub realtime_synced: u64,
    pub historical_synced: u64,
    pub timeseries_synced: u64,
    pub statistics_synced: u64,
    pub cycles: u64,
    pub errors: u64,
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            realtime_synced: self.realtime_synced.load(Ordering::Relaxed),
            historical_synced: self.historical_synced.load(Ordering::Relaxed),
            timeseries_synced: self.timeseries_synced.load(Ordering::Relaxed),
            statistics_synced: self.statistics_synced.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn counter_for(&self, kind: DataKind) -> &AtomicU64 {
        match kind {
            DataKind::Realtime => &self.realtime_synced,
            DataKind::History => &self.historical_synced,
            DataKind::Timeseries => &self.timeseries_synced,
            DataKind::Statistics => &self.statistics_synced,
        }
    }
}

/// Cache keys of one kind, flat keys first so prefixed records win on
/// natural-key conflicts.
pub(crate) async fn discover_keys(
    cache: &dyn Cache,
    kind: DataKind,
) -> Result<Vec<(String, ParsedKey)>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for pattern in kind.scan_patterns() {
        for key in cache.scan_match(pattern).await? {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(parsed) = parse_key(&key) {
                if parsed.kind == kind {
                    keys.push((key, parsed));
                }
            }
        }
    }
    keys.sort_by(|a, b| {
        (a.1.session.is_some(), &a.0).cmp(&(b.1.session.is_some(), &b.0))
    });
    Ok(keys)
}

/// True when `timestamp` is strictly newer than the ledger entry for
/// `(data_type, key)`.
pub(crate) async fn ledger_is_newer(
    store: &dyn DocStore,
    data_type: &str,
    key: &str,
    timestamp: i64,
) -> Result<bool> {
    let entry = store
        .find_one(documents::SYNC_STATUS, documents::sync_status_filter(data_type, key))
        .await?;
    Ok(match entry.and_then(|doc| doc.get_i64("timestamp").ok()) {
        Some(recorded) => timestamp > recorded,
        None => true,
    })
}

pub(crate) async fn ledger_record(
    store: &dyn DocStore,
    data_type: &str,
    key: &str,
    timestamp: i64,
) -> Result<()> {
    let (filter, update) = documents::sync_status_write(data_type, key, timestamp);
    store.upsert(documents::SYNC_STATUS, filter, update).await
}

/// Replicate new sorted-set members of one timeseries key, resuming from
/// the recorded `(last_score, tie_seq)` watermark. Used by both the
/// realtime sync and the bulk migrator; progress is checkpointed after
/// every page.
pub(crate) async fn sync_timeseries_key(
    cache: &dyn Cache,
    store: &dyn DocStore,
    key: &str,
    channel: u16,
    session: &str,
    collection: &str,
    page_size: usize,
) -> Result<u64> {
    let ledger_name = DataKind::Timeseries.ledger_name();
    let progress = store
        .find_one(
            documents::SYNC_PROGRESS,
            documents::sync_progress_filter(ledger_name, key),
        )
        .await?;
    let mut count = progress
        .as_ref()
        .and_then(|doc| doc.get_i64("count").ok())
        .unwrap_or(0);
    let mut last_score = progress
        .as_ref()
        .and_then(|doc| doc.get_f64("last_score").ok());
    let mut tie_seq = progress
        .as_ref()
        .and_then(|doc| doc.get_i64("tie_seq").ok())
        .unwrap_or(-1);

    let mut written = 0u64;
    let mut limit = page_size.max(1);
    loop {
        let min = last_score.unwrap_or(f64::NEG_INFINITY);
        let page = cache.zset_range_by_score(key, min, true, limit).await?;
        let page_len = page.len();

        let fresh: Vec<(f64, i64, f64)> = page
            .iter()
            .filter_map(|(member, score)| {
                let (value, seq) = records::parse_member(member)?;
                match last_score {
                    Some(watermark) if *score == watermark && seq <= tie_seq => None,
                    _ => Some((*score, seq, value)),
                }
            })
            .collect();

        if fresh.is_empty() {
            if page_len >= limit {
                // A full page of already-synced equal-score members; widen
                // the window until new members become visible.
                limit *= 2;
                continue;
            }
            break;
        }

        let writes: Vec<_> = fresh
            .iter()
            .map(|(score, _, value)| documents::timeseries_write(session, channel, *score, *value))
            .collect();
        let applied = store.bulk_upsert(collection, writes).await? as u64;
        written += applied;
        count += applied as i64;

        for (score, seq, _) in &fresh {
            match last_score {
                Some(watermark) if *score < watermark => {}
                Some(watermark) if *score == watermark => tie_seq = tie_seq.max(*seq),
                _ => {
                    last_score = Some(*score);
                    tie_seq = *seq;
                }
            }
        }
        store
            .upsert(
                documents::SYNC_PROGRESS,
                documents::sync_progress_filter(ledger_name, key),
                documents::sync_progress_score(count, last_score.unwrap_or_default(), tie_seq),
            )
            .await?;

        if page_len < limit {
            break;
        }
    }
    Ok(written)
}

/// The four replication workers plus their shared context.
pub struct SyncWorkers {
    cache: Arc<dyn Cache>,
    store: Arc<dyn DocStore>,
    config: SyncConfig,
    /// Session attributed to flat (unprefixed) cache keys.
    session_fallback: String,
    stats: Arc<SyncStats>,
}

impl SyncWorkers {
    pub fn new(
        cache: Arc<dyn Cache>,
        store: Arc<dyn DocStore>,
        config: SyncConfig,
        session_fallback: String,
    ) -> Self {
        Self {
            cache,
            store,
            config,
            session_fallback,
            stats: Arc::new(SyncStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        self.stats.clone()
    }

    fn session_for(&self, parsed: &ParsedKey) -> String {
        parsed
            .session
            .clone()
            .unwrap_or_else(|| self.session_fallback.clone())
    }

    /// Spawn one worker task per data kind.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let periods = [
            (DataKind::Realtime, self.config.realtime_period_ms),
            (DataKind::History, self.config.historical_period_ms),
            (DataKind::Timeseries, self.config.timeseries_period_ms),
            (DataKind::Statistics, self.config.statistics_period_ms),
        ];
        periods
            .into_iter()
            .map(|(kind, period_ms)| {
                let workers = self.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    workers.worker_loop(kind, period_ms, token).await;
                })
            })
            .collect()
    }

    /// Self-clocked loop: if a cycle overruns its period the next one
    /// starts immediately after; a deadline bounds each cycle's work.
    async fn worker_loop(&self, kind: DataKind, period_ms: u64, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let deadline = Duration::from_millis(self.config.cycle_deadline_ms.max(period_ms));
        info!(kind = kind.ledger_name(), period_ms, "sync worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cycle = self.run_cycle(kind);
            match tokio::time::timeout(deadline, cycle).await {
                Ok(Ok(written)) => {
                    if written > 0 {
                        debug!(kind = kind.ledger_name(), written, "sync cycle complete");
                    }
                }
                Ok(Err(e)) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(kind = kind.ledger_name(), error = %e, "sync cycle failed");
                }
                Err(_) => {
                    // Unfinished work is picked up next cycle via the ledgers
                    warn!(kind = kind.ledger_name(), "sync cycle hit deadline");
                }
            }
        }
        info!(kind = kind.ledger_name(), "sync worker stopped");
    }

    /// Run one replication cycle for a data kind; returns documents written.
    pub async fn run_cycle(&self, kind: DataKind) -> Result<u64> {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let written = match kind {
            DataKind::Realtime => self.realtime_cycle().await?,
            DataKind::History => self.historical_cycle().await?,
            DataKind::Timeseries => self.timeseries_cycle().await?,
            DataKind::Statistics => self.statistics_cycle().await?,
        };
        self.stats
            .counter_for(kind)
            .fetch_add(written, Ordering::Relaxed);
        Ok(written)
    }

    async fn realtime_cycle(&self) -> Result<u64> {
        let ledger = DataKind::Realtime.ledger_name();
        let mut written = 0u64;
        for (key, parsed) in discover_keys(self.cache.as_ref(), DataKind::Realtime).await? {
            let fields = self.cache.hash_get_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            let Some(record) = records::parse_realtime(&fields, parsed.channel) else {
                continue;
            };
            if !ledger_is_newer(self.store.as_ref(), ledger, &key, record.timestamp).await? {
                continue;
            }
            let session = self.session_for(&parsed);
            let (filter, update) =
                documents::realtime_write(&session, record.timestamp, &record.channels);
            self.store
                .upsert(
                    &documents::realtime_collection(parsed.sensor_type),
                    filter,
                    update,
                )
                .await
                .context("realtime upsert")?;
            ledger_record(self.store.as_ref(), ledger, &key, record.timestamp).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Lists append at the head; progress records `(count, head_ts)`. When
    /// the list sits at capacity it may have been trimmed underneath the
    /// count, so the cycle rereads everything and reconciles by timestamp.
    async fn historical_cycle(&self) -> Result<u64> {
        let ledger = DataKind::History.ledger_name();
        let mut written = 0u64;
        for (key, parsed) in discover_keys(self.cache.as_ref(), DataKind::History).await? {
            let len = self.cache.list_len(&key).await?;
            if len == 0 {
                continue;
            }
            let progress = self
                .store
                .find_one(
                    documents::SYNC_PROGRESS,
                    documents::sync_progress_filter(ledger, &key),
                )
                .await?;
            let prev_count = progress
                .as_ref()
                .and_then(|doc| doc.get_i64("count").ok())
                .unwrap_or(0);
            let prev_head = progress
                .as_ref()
                .and_then(|doc| doc.get_i64("head_ts").ok())
                .unwrap_or(i64::MIN);

            let head = self.cache.list_range(&key, 0, 0).await?;
            let Some(head_ts) = head
                .first()
                .and_then(|raw| records::parse_history_entry(raw))
                .map(|entry| entry.timestamp)
            else {
                continue;
            };
            if head_ts == prev_head {
                continue;
            }

            let fresh_window = len as i64 - prev_count;
            let raw_entries = if prev_count > 0 && len < HISTORY_MAX_LEN && fresh_window > 0 {
                self.cache
                    .list_range(&key, 0, fresh_window as isize - 1)
                    .await?
            } else {
                // First sync, or trimmed at capacity: reconcile everything
                self.cache.list_range(&key, 0, -1).await?
            };

            let session = self.session_for(&parsed);
            let writes: Vec<_> = raw_entries
                .iter()
                .filter_map(|raw| records::parse_history_entry(raw))
                .filter(|entry| entry.timestamp > prev_head)
                .map(|entry| {
                    documents::historical_write(&session, entry.timestamp, &entry.values)
                })
                .collect();
            if writes.is_empty() {
                continue;
            }
            let applied = self
                .store
                .bulk_upsert(
                    &documents::historical_collection(parsed.sensor_type),
                    writes,
                )
                .await? as u64;
            written += applied;
            self.store
                .upsert(
                    documents::SYNC_PROGRESS,
                    documents::sync_progress_filter(ledger, &key),
                    documents::sync_progress_count(prev_count + applied as i64, head_ts),
                )
                .await?;
        }
        Ok(written)
    }

    async fn timeseries_cycle(&self) -> Result<u64> {
        let mut written = 0u64;
        for (key, parsed) in discover_keys(self.cache.as_ref(), DataKind::Timeseries).await? {
            let Some(channel) = parsed.channel else {
                continue;
            };
            let session = self.session_for(&parsed);
            written += sync_timeseries_key(
                self.cache.as_ref(),
                self.store.as_ref(),
                &key,
                channel,
                &session,
                &documents::timeseries_collection(parsed.sensor_type),
                self.config.page_size,
            )
            .await?;
        }
        Ok(written)
    }

    async fn statistics_cycle(&self) -> Result<u64> {
        let ledger = DataKind::Statistics.ledger_name();
        let mut written = 0u64;
        for (key, parsed) in discover_keys(self.cache.as_ref(), DataKind::Statistics).await? {
            let fields = self.cache.hash_get_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            let Some(record) = records::parse_statistics(&fields) else {
                continue;
            };
            if !ledger_is_newer(self.store.as_ref(), ledger, &key, record.last_update).await? {
                continue;
            }
            let session = self.session_for(&parsed);
            let summary = StatisticsSummary {
                min: record.min,
                max: record.max,
                avg: record.avg,
                channel_min: record.channel_min,
                channel_max: record.channel_max,
                last_update: record.last_update,
                channels: record.channels,
            };
            let (filter, update) = documents::statistics_write(&session, &summary);
            self.store
                .upsert(
                    &documents::statistics_collection(parsed.sensor_type),
                    filter,
                    update,
                )
                .await
                .context("statistics upsert")?;
            ledger_record(self.store.as_ref(), ledger, &key, record.last_update).await?;
            written += 1;
        }
        Ok(written)
    }
}
