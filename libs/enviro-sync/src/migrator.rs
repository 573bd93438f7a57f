//! Bulk migrator
//!
//! One-shot copy of cache contents into the document store. Works key by
//! key with progress checkpoints after every page, so a killed migration
//! resumes where it stopped, and a completed one re-runs as a no-op
//! (natural-key upserts). A failure on one key is recorded and the
//! migration moves on to the next key.

use crate::records;
use crate::workers::{
    discover_keys, ledger_is_newer, ledger_record, sync_timeseries_key,
};
use anyhow::{Context, Result};
use enviro_model::{DataKind, ParsedKey};
use enviro_rtdb::Cache;
use enviro_store::documents::{self, StatisticsSummary};
use enviro_store::DocStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one migration run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub realtime_records: u64,
    pub historical_records: u64,
    pub timeseries_points: u64,
    pub statistics_records: u64,
    pub per_key_errors: Vec<(String, String)>,
}

impl MigrationSummary {
    fn absorb(&mut self, kind: DataKind, count: u64) {
        match kind {
            DataKind::Realtime => self.realtime_records += count,
            DataKind::History => self.historical_records += count,
            DataKind::Timeseries => self.timeseries_points += count,
            DataKind::Statistics => self.statistics_records += count,
        }
    }
}

/// Cache → document store bulk copier.
pub struct Migrator {
    cache: Arc<dyn Cache>,
    store: Arc<dyn DocStore>,
    page_size: usize,
    /// Session attributed to flat (unprefixed) cache keys.
    session_fallback: String,
}

impl Migrator {
    pub fn new(
        cache: Arc<dyn Cache>,
        store: Arc<dyn DocStore>,
        page_size: usize,
        session_fallback: String,
    ) -> Self {
        Self {
            cache,
            store,
            page_size: page_size.max(1),
            session_fallback,
        }
    }

    /// Sessions present in the cache (prefixed keys only; flat keys belong
    /// to the configured fallback session).
    pub async fn discover_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = Vec::new();
        for kind in DataKind::all() {
            for (_, parsed) in discover_keys(self.cache.as_ref(), kind).await? {
                if let Some(session) = parsed.session {
                    if !sessions.contains(&session) {
                        sessions.push(session);
                    }
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Migrate everything, or only the named sessions.
    pub async fn run(&self, sessions: Option<&[String]>) -> Result<MigrationSummary> {
        self.store
            .ensure_indexes()
            .await
            .context("index bootstrap")?;

        let mut summary = MigrationSummary::default();
        for kind in DataKind::all() {
            for (key, parsed) in discover_keys(self.cache.as_ref(), kind).await? {
                let session = parsed
                    .session
                    .clone()
                    .unwrap_or_else(|| self.session_fallback.clone());
                if let Some(wanted) = sessions {
                    if !wanted.iter().any(|s| s == &session) {
                        continue;
                    }
                }
                summary.attempted += 1;
                match self.migrate_key(kind, &key, &parsed, &session).await {
                    Ok(count) => {
                        summary.succeeded += 1;
                        summary.absorb(kind, count);
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!(key = %key, error = %e, "key migration failed, continuing");
                        summary.per_key_errors.push((key, e.to_string()));
                    }
                }
            }
        }
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            realtime = summary.realtime_records,
            historical = summary.historical_records,
            timeseries = summary.timeseries_points,
            statistics = summary.statistics_records,
            "migration finished"
        );
        Ok(summary)
    }

    async fn migrate_key(
        &self,
        kind: DataKind,
        key: &str,
        parsed: &ParsedKey,
        session: &str,
    ) -> Result<u64> {
        match kind {
            DataKind::Realtime => self.migrate_realtime(key, parsed, session).await,
            DataKind::History => self.migrate_history(key, parsed, session).await,
            DataKind::Timeseries => self.migrate_timeseries(key, parsed, session).await,
            DataKind::Statistics => self.migrate_statistics(key, parsed, session).await,
        }
    }

    async fn migrate_realtime(
        &self,
        key: &str,
        parsed: &ParsedKey,
        session: &str,
    ) -> Result<u64> {
        let fields = self.cache.hash_get_all(key).await?;
        let Some(record) = records::parse_realtime(&fields, parsed.channel) else {
            return Ok(0);
        };
        let ledger = DataKind::Realtime.ledger_name();
        if !ledger_is_newer(self.store.as_ref(), ledger, key, record.timestamp).await? {
            return Ok(0);
        }
        let (filter, update) =
            documents::realtime_write(session, record.timestamp, &record.channels);
        self.store
            .upsert(
                &documents::realtime_collection(parsed.sensor_type),
                filter,
                update,
            )
            .await?;
        ledger_record(self.store.as_ref(), ledger, key, record.timestamp).await?;
        Ok(1)
    }

    /// Page through the list from the recorded offset. Head-inserted
    /// entries arriving during a live migration shift offsets, which is
    /// tolerated: every write is a natural-key upsert.
    async fn migrate_history(&self, key: &str, parsed: &ParsedKey, session: &str) -> Result<u64> {
        let ledger = DataKind::History.ledger_name();
        let progress = self
            .store
            .find_one(
                documents::SYNC_PROGRESS,
                documents::sync_progress_filter(ledger, key),
            )
            .await?;
        let mut offset = progress
            .as_ref()
            .and_then(|doc| doc.get_i64("count").ok())
            .unwrap_or(0)
            .max(0);

        let head_ts = self
            .cache
            .list_range(key, 0, 0)
            .await?
            .first()
            .and_then(|raw| records::parse_history_entry(raw))
            .map(|entry| entry.timestamp)
            .unwrap_or(0);

        let collection = documents::historical_collection(parsed.sensor_type);
        let mut written = 0u64;
        loop {
            let page = self
                .cache
                .list_range(
                    key,
                    offset as isize,
                    (offset + self.page_size as i64 - 1) as isize,
                )
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            let writes: Vec<_> = page
                .iter()
                .filter_map(|raw| records::parse_history_entry(raw))
                .map(|entry| documents::historical_write(session, entry.timestamp, &entry.values))
                .collect();
            written += self.store.bulk_upsert(&collection, writes).await? as u64;
            offset += page_len as i64;
            self.store
                .upsert(
                    documents::SYNC_PROGRESS,
                    documents::sync_progress_filter(ledger, key),
                    documents::sync_progress_count(offset, head_ts),
                )
                .await?;
            if page_len < self.page_size {
                break;
            }
        }
        Ok(written)
    }

    async fn migrate_timeseries(
        &self,
        key: &str,
        parsed: &ParsedKey,
        session: &str,
    ) -> Result<u64> {
        let Some(channel) = parsed.channel else {
            return Ok(0);
        };
        sync_timeseries_key(
            self.cache.as_ref(),
            self.store.as_ref(),
            key,
            channel,
            session,
            &documents::timeseries_collection(parsed.sensor_type),
            self.page_size,
        )
        .await
    }

    async fn migrate_statistics(
        &self,
        key: &str,
        parsed: &ParsedKey,
        session: &str,
    ) -> Result<u64> {
        let fields = self.cache.hash_get_all(key).await?;
        let Some(record) = records::parse_statistics(&fields) else {
            return Ok(0);
        };
        let ledger = DataKind::Statistics.ledger_name();
        if !ledger_is_newer(self.store.as_ref(), ledger, key, record.last_update).await? {
            return Ok(0);
        }
        let summary = StatisticsSummary {
            min: record.min,
            max: record.max,
            avg: record.avg,
            channel_min: record.channel_min,
            channel_max: record.channel_max,
            last_update: record.last_update,
            channels: record.channels,
        };
        let (filter, update) = documents::statistics_write(session, &summary);
        self.store
            .upsert(
                &documents::statistics_collection(parsed.sensor_type),
                filter,
                update,
            )
            .await?;
        ledger_record(self.store.as_ref(), ledger, key, record.last_update).await?;
        Ok(1)
    }
}
