//! Replication scenarios against the in-memory backends: resumable
//! migration, at-most-once sync, incremental history, legacy key support.

use async_trait::async_trait;
use bson::{doc, Document};
use bytes::Bytes;
use enviro_model::DataKind;
use enviro_rtdb::{Cache, MemoryCache};
use enviro_store::{DocStore, MemoryStore};
use enviro_sync::{Migrator, SyncWorkers};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const SESSION: &str = "20240101_000000";

fn sync_config(page_size: usize) -> enviro_config::SyncConfig {
    enviro_config::SyncConfig {
        page_size,
        ..enviro_config::SyncConfig::default()
    }
}

fn workers(cache: Arc<MemoryCache>, store: Arc<MemoryStore>) -> SyncWorkers {
    SyncWorkers::new(cache, store, sync_config(200), SESSION.to_string())
}

async fn run_all_cycles(workers: &SyncWorkers) -> u64 {
    let mut written = 0;
    for kind in DataKind::all() {
        written += workers.run_cycle(kind).await.unwrap();
    }
    written
}

fn hash_fields(pairs: &[(&str, &str)]) -> Vec<(String, Bytes)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Bytes::from(v.to_string())))
        .collect()
}

/// Populate one sensor's worth of current-schema records.
async fn seed_current_schema(cache: &MemoryCache, timestamp: i64) {
    let ts = timestamp.to_string();
    cache
        .hash_set_all(
            "sensor:temperature:temperature_m1_01:realtime",
            hash_fields(&[
                ("timestamp", ts.as_str()),
                ("value", "25.0"),
                ("raw", "250"),
                ("unit", "°C"),
                ("channel", "1"),
                ("module_id", "m1"),
            ]),
        )
        .await
        .unwrap();
    cache
        .list_lpush(
            "sensor:temperature:m1:history",
            Bytes::from(format!(
                r#"{{"timestamp": {timestamp}, "values": [25.0, -2.0]}}"#
            )),
        )
        .await
        .unwrap();
    cache
        .zset_add(
            "sensor:temperature:temperature_m1_01:timeseries",
            timestamp as f64 / 1000.0,
            &format!("25:{}", timestamp),
        )
        .await
        .unwrap();
    cache
        .hash_set_all(
            "sensor:temperature:statistics",
            hash_fields(&[
                ("last_update", ts.as_str()),
                ("channel_count", "2"),
                ("min", "-2.0"),
                ("max", "25.0"),
                ("avg", "11.5"),
                ("channel_min", "02"),
                ("channel_max", "01"),
                ("channel_01", "25.0"),
                ("channel_02", "-2.0"),
            ]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn sync_replicates_every_family() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    seed_current_schema(&cache, 1_700_000_000_000).await;

    let workers = workers(cache.clone(), store.clone());
    let written = run_all_cycles(&workers).await;
    assert_eq!(written, 4);

    let rt = store
        .find_one("realtime_temperature", doc! { "session_prefix": SESSION })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rt.get_i64("timestamp").unwrap(), 1_700_000_000_000);
    let channels = rt.get_document("channels").unwrap();
    let channel = channels.get_document("channel_01").unwrap();
    assert_eq!(channel.get_f64("value").unwrap(), 25.0);
    assert_eq!(channel.get_i64("raw").unwrap(), 250);

    let hist = store
        .find_one("historical_temperature", doc! { "session_prefix": SESSION })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hist.get_i64("channel_count").unwrap(), 2);

    assert_eq!(
        store.count("timeseries_temperature", doc! {}).await.unwrap(),
        1
    );

    let stats = store
        .find_one("statistics_temperature", doc! { "session_prefix": SESSION })
        .await
        .unwrap()
        .unwrap();
    let summary = stats.get_document("statistics").unwrap();
    assert_eq!(summary.get_f64("avg").unwrap(), 11.5);
    assert_eq!(summary.get_str("channel_min").unwrap(), "channel_02");
}

#[tokio::test]
async fn second_sync_run_writes_nothing() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    seed_current_schema(&cache, 1_700_000_000_000).await;

    let workers = workers(cache.clone(), store.clone());
    assert!(run_all_cycles(&workers).await > 0);
    let ops_after_first = store.write_ops();

    // Acquisition paused: no cache changes between runs
    let written = run_all_cycles(&workers).await;
    assert_eq!(written, 0);
    assert_eq!(store.write_ops(), ops_after_first);
}

#[tokio::test]
async fn sync_picks_up_newer_records_only() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    seed_current_schema(&cache, 1_700_000_000_000).await;

    let workers = workers(cache.clone(), store.clone());
    run_all_cycles(&workers).await;

    // Same timestamps rewritten: still nothing to do
    seed_current_schema(&cache, 1_700_000_000_000).await;
    assert_eq!(run_all_cycles(&workers).await, 0);

    // Newer poll arrives
    seed_current_schema(&cache, 1_700_000_005_000).await;
    let written = run_all_cycles(&workers).await;
    assert_eq!(written, 4);
}

#[tokio::test]
async fn historical_sync_is_incremental_by_count() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    let key = "sensor:wind_speed:w1:history";

    for i in 0..5i64 {
        cache
            .list_lpush(
                key,
                Bytes::from(format!(r#"{{"timestamp": {}, "values": [{}.0]}}"#, 1000 + i, i)),
            )
            .await
            .unwrap();
    }
    let workers = workers(cache.clone(), store.clone());
    assert_eq!(workers.run_cycle(DataKind::History).await.unwrap(), 5);

    // Three more polls appended at the head
    for i in 5..8i64 {
        cache
            .list_lpush(
                key,
                Bytes::from(format!(r#"{{"timestamp": {}, "values": [{}.0]}}"#, 1000 + i, i)),
            )
            .await
            .unwrap();
    }
    assert_eq!(workers.run_cycle(DataKind::History).await.unwrap(), 3);
    assert_eq!(
        store.count("historical_wind_speed", doc! {}).await.unwrap(),
        8
    );
}

#[tokio::test]
async fn timeseries_sync_advances_watermark_across_ties() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    let key = "sensor:pressure:pressure_p1_01:timeseries";

    // Two members share the final score; tie_seq must cover both
    cache.zset_add(key, 100.0, "1.5:1").await.unwrap();
    cache.zset_add(key, 101.0, "1.6:2").await.unwrap();
    cache.zset_add(key, 101.0, "1.7:3").await.unwrap();

    let workers = workers(cache.clone(), store.clone());
    assert_eq!(workers.run_cycle(DataKind::Timeseries).await.unwrap(), 3);
    assert_eq!(workers.run_cycle(DataKind::Timeseries).await.unwrap(), 0);

    // A later tie at the same score is still picked up
    cache.zset_add(key, 101.0, "1.8:4").await.unwrap();
    assert_eq!(workers.run_cycle(DataKind::Timeseries).await.unwrap(), 1);

    // (session, channel, timestamp_unix) keys: 100.0 and 101.0 collapse ties
    assert_eq!(
        store.count("timeseries_pressure", doc! {}).await.unwrap(),
        2
    );
}

/// Store wrapper that starts failing after a write budget, emulating a
/// migration killed mid-flight.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    budget: AtomicI64,
}

#[async_trait]
impl DocStore for FlakyStore {
    async fn ping(&self) -> anyhow::Result<()> {
        self.inner.ping().await
    }

    async fn ensure_indexes(&self) -> anyhow::Result<()> {
        self.inner.ensure_indexes().await
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> anyhow::Result<()> {
        // Ledger writes stay cheap and always succeed
        self.inner.upsert(collection, filter, update).await
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        writes: Vec<(Document, Document)>,
    ) -> anyhow::Result<usize> {
        let remaining = self.budget.fetch_sub(writes.len() as i64, Ordering::SeqCst);
        if remaining < writes.len() as i64 {
            anyhow::bail!("store connection lost");
        }
        self.inner.bulk_upsert(collection, writes).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> anyhow::Result<Option<Document>> {
        self.inner.find_one(collection, filter).await
    }

    async fn count(&self, collection: &str, filter: Document) -> anyhow::Result<u64> {
        self.inner.count(collection, filter).await
    }
}

#[tokio::test]
async fn migration_resumes_after_interruption() {
    let cache = Arc::new(MemoryCache::new());
    let key = "sensor:temperature:temperature_m1_01:timeseries";
    for i in 0..1000i64 {
        cache
            .zset_add(key, 1000.0 + i as f64, &format!("{}:{}", i as f64 / 10.0, i))
            .await
            .unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    // Dies after ~600 inserts
    let flaky = Arc::new(FlakyStore {
        inner: store.clone(),
        budget: AtomicI64::new(600),
    });
    let migrator = Migrator::new(cache.clone(), flaky, 50, SESSION.to_string());
    let summary = migrator.run(None).await.unwrap();
    assert_eq!(summary.failed, 1);
    let partial = store
        .count("timeseries_temperature", doc! {})
        .await
        .unwrap();
    assert!(partial >= 500 && partial < 1000, "partial = {partial}");

    // Restart against a healthy store: resumes from sync_progress
    let migrator = Migrator::new(cache, store.clone(), 50, SESSION.to_string());
    let summary = migrator.run(None).await.unwrap();
    assert_eq!(summary.failed, 0);
    assert!(summary.timeseries_points < 1000, "resumed, not restarted");

    assert_eq!(
        store.count("timeseries_temperature", doc! {}).await.unwrap(),
        1000
    );
    // No duplicates on the natural key
    assert_eq!(
        store
            .count(
                "timeseries_temperature",
                doc! { "session_prefix": SESSION, "channel": 1i64, "timestamp_unix": 1500.0 },
            )
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn completed_migration_reruns_as_noop() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    seed_current_schema(&cache, 1_700_000_000_000).await;

    let migrator = Migrator::new(cache.clone(), store.clone(), 200, SESSION.to_string());
    let first = migrator.run(None).await.unwrap();
    assert_eq!(first.failed, 0);
    assert!(first.succeeded > 0);
    let ops = store.write_ops();
    let inserts = store.insert_ops();

    let second = migrator.run(None).await.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(second.realtime_records, 0);
    assert_eq!(second.timeseries_points, 0);
    assert_eq!(second.statistics_records, 0);
    assert_eq!(store.insert_ops(), inserts);
    // History re-pages idempotently; nothing new may be created
    assert!(store.write_ops() >= ops);
}

#[tokio::test]
async fn migrator_handles_legacy_keys() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());

    cache
        .hash_set_all(
            "temperature:realtime",
            hash_fields(&[
                ("timestamp", "2023-12-08T12:00:00"),
                ("channel_count", "2"),
                ("channel_01", "25.0"),
                ("channel_01_raw", "250"),
                ("channel_02", "-2.0"),
                ("channel_02_raw", "65516"),
            ]),
        )
        .await
        .unwrap();
    cache
        .list_lpush(
            "temperature:history",
            Bytes::from(r#"{"timestamp": "2023-12-08T12:00:00", "temperatures": [25.0, -2.0]}"#),
        )
        .await
        .unwrap();
    // Legacy members carry no counter suffix; two distinct values at one
    // second collapse onto one natural key
    cache
        .zset_add("temperature:timeseries:channel_01", 1000.0, "25.0")
        .await
        .unwrap();
    cache
        .zset_add("temperature:timeseries:channel_01", 1000.0, "25.1")
        .await
        .unwrap();
    cache
        .zset_add("temperature:timeseries:channel_01", 1001.0, "25.2")
        .await
        .unwrap();
    cache
        .hash_set_all(
            "temperature:statistics",
            hash_fields(&[
                ("last_update", "2023-12-08T12:00:01"),
                ("channel_count", "2"),
                ("min_temperature", "-2.0"),
                ("max_temperature", "25.0"),
                ("avg_temperature", "11.5"),
                ("channel_min", "02"),
                ("channel_max", "01"),
                ("channel_01", "25.0"),
                ("channel_02", "-2.0"),
            ]),
        )
        .await
        .unwrap();

    let migrator = Migrator::new(cache, store.clone(), 200, SESSION.to_string());
    let summary = migrator.run(None).await.unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.realtime_records, 1);
    assert_eq!(summary.historical_records, 1);
    assert_eq!(summary.statistics_records, 1);

    // Flat keys belong to the configured session
    let rt = store
        .find_one("realtime_temperature", doc! { "session_prefix": SESSION })
        .await
        .unwrap()
        .unwrap();
    let channels = rt.get_document("channels").unwrap();
    assert_eq!(
        channels
            .get_document("channel_02")
            .unwrap()
            .get_f64("value")
            .unwrap(),
        -2.0
    );

    // Duplicate (timestamp, channel) members deduplicated on migration
    assert_eq!(
        store.count("timeseries_temperature", doc! {}).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn session_filter_restricts_migration() {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());

    for session in ["20230101_000000", "20230202_000000"] {
        cache
            .hash_set_all(
                &format!("{session}:sensor:humidity:statistics"),
                hash_fields(&[
                    ("last_update", "1700000000000"),
                    ("min", "40.0"),
                    ("max", "60.0"),
                    ("avg", "50.0"),
                    ("channel_01", "50.0"),
                ]),
            )
            .await
            .unwrap();
    }

    let migrator = Migrator::new(cache.clone(), store.clone(), 200, SESSION.to_string());
    let sessions = migrator.discover_sessions().await.unwrap();
    assert_eq!(sessions, vec!["20230101_000000", "20230202_000000"]);

    let only = vec!["20230101_000000".to_string()];
    let summary = migrator.run(Some(&only)).await.unwrap();
    assert_eq!(summary.statistics_records, 1);
    assert_eq!(
        store
            .count(
                "statistics_humidity",
                doc! { "session_prefix": "20230101_000000" },
            )
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .count(
                "statistics_humidity",
                doc! { "session_prefix": "20230202_000000" },
            )
            .await
            .unwrap(),
        0
    );
}
