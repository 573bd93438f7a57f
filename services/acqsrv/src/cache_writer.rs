//! Cache writer
//!
//! Publishes readings into the cache tier under the documented key schema:
//! per-sensor realtime hash (TTL 3600 s), per-module history list (one JSON
//! entry per completed poll, 1000 entries), per-sensor timeseries sorted
//! set (10000 members), and the per-type statistics hash. All writes go
//! through the pipelined write buffer (64 ops / 50 ms) and never block the
//! input stream; failures only bump counters.

use bytes::Bytes;
use enviro_model::{SensorReading, SensorType};
use enviro_rtdb::{CacheOp, KeySpace, WriteBuffer, WriteBufferConfig, WriteBufferStatsSnapshot};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache layout bounds.
#[derive(Debug, Clone)]
pub struct CacheWriterConfig {
    pub realtime_ttl_secs: i64,
    pub history_max_len: usize,
    pub timeseries_max_len: usize,
    /// Incomplete polls older than this are flushed as-is (a channel was
    /// dropped by the decoder).
    pub stale_poll_ms: i64,
}

impl Default for CacheWriterConfig {
    fn default() -> Self {
        Self {
            realtime_ttl_secs: 3600,
            history_max_len: 1000,
            timeseries_max_len: 10_000,
            stale_poll_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PollGroup {
    timestamp: i64,
    values: BTreeMap<u16, f64>,
}

#[derive(Default)]
struct WriterState {
    /// In-flight poll per (module, type); emitted as one history entry.
    polls: HashMap<(String, SensorType), PollGroup>,
    /// Per-sensor monotonic counter suffixing timeseries members.
    sequences: HashMap<String, u64>,
    /// Latest value per channel per type, feeding the statistics hash.
    latest: HashMap<SensorType, BTreeMap<u16, f64>>,
}

/// Counters exposed through `statistics()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWriterStats {
    pub readings: u64,
    pub polls_completed: u64,
    pub buffer: WriteBufferStatsSnapshot,
}

/// Fans readings into cache ops; a background flush loop drains the buffer.
pub struct CacheWriter {
    buffer: Arc<WriteBuffer>,
    keyspace: KeySpace,
    config: CacheWriterConfig,
    /// Expected channels per (module, type); completes a poll group early.
    expected_channels: HashMap<(String, SensorType), u16>,
    state: Mutex<WriterState>,
    readings: AtomicU64,
    polls_completed: AtomicU64,
}

impl CacheWriter {
    pub fn new(keyspace: KeySpace, config: CacheWriterConfig) -> Self {
        Self {
            buffer: Arc::new(WriteBuffer::new(WriteBufferConfig::default())),
            keyspace,
            config,
            expected_channels: HashMap::new(),
            state: Mutex::new(WriterState::default()),
            readings: AtomicU64::new(0),
            polls_completed: AtomicU64::new(0),
        }
    }

    /// Register how many channels one (module, type) pair produces per
    /// poll, so history entries close as soon as the last channel arrives.
    pub fn expect_channels(&mut self, module_id: &str, sensor_type: SensorType, channels: u16) {
        self.expected_channels
            .insert((module_id.to_string(), sensor_type), channels);
    }

    /// The shared write buffer (for the flush loop and statistics).
    pub fn buffer(&self) -> Arc<WriteBuffer> {
        self.buffer.clone()
    }

    pub fn statistics(&self) -> CacheWriterStats {
        CacheWriterStats {
            readings: self.readings.load(Ordering::Relaxed),
            polls_completed: self.polls_completed.load(Ordering::Relaxed),
            buffer: self.buffer.stats().snapshot(),
        }
    }

    /// Handle one reading: realtime + timeseries immediately, history and
    /// statistics once its poll group completes. Fire-and-forget.
    pub fn handle(&self, reading: &SensorReading) {
        self.readings.fetch_add(1, Ordering::Relaxed);
        let mut ops = Vec::with_capacity(2);

        // Realtime hash, TTL refreshed on every write
        ops.push(CacheOp::HashSetAll {
            key: self
                .keyspace
                .realtime(reading.sensor_type, &reading.sensor_id),
            fields: vec![
                ("timestamp".into(), Bytes::from(reading.timestamp.to_string())),
                ("value".into(), Bytes::from(reading.value.to_string())),
                ("raw".into(), Bytes::from(reading.raw.to_string())),
                ("unit".into(), Bytes::from(reading.unit.clone())),
                ("channel".into(), Bytes::from(reading.channel.to_string())),
                ("module_id".into(), Bytes::from(reading.module_id.clone())),
            ],
            ttl_secs: Some(self.config.realtime_ttl_secs),
        });

        // Timeseries member: value with a monotonic counter suffix so equal
        // values at one instant stay distinct members.
        let completed = {
            let mut state = self.state.lock();
            let seq = state
                .sequences
                .entry(reading.sensor_id.clone())
                .or_insert(0);
            *seq += 1;
            let member = format!("{}:{}", reading.value, seq);
            ops.push(CacheOp::ZSetAddTrim {
                key: self
                    .keyspace
                    .timeseries(reading.sensor_type, &reading.sensor_id),
                score: reading.timestamp_unix(),
                member,
                max_len: self.config.timeseries_max_len,
            });

            self.absorb_into_poll(&mut state, reading)
        };

        if let Some((module_id, sensor_type, group)) = completed {
            self.finish_poll(&mut ops, &module_id, sensor_type, group);
        }
        self.buffer.push_all(ops);
    }

    /// Flush poll groups whose module stopped mid-poll (decoder drops).
    pub fn flush_stale(&self, now_millis: i64) {
        let stale: Vec<((String, SensorType), PollGroup)> = {
            let mut state = self.state.lock();
            let cutoff = now_millis - self.config.stale_poll_ms;
            let keys: Vec<(String, SensorType)> = state
                .polls
                .iter()
                .filter(|(_, group)| group.timestamp < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| state.polls.remove(&key).map(|group| (key, group)))
                .collect()
        };
        let mut ops = Vec::new();
        for ((module_id, sensor_type), group) in stale {
            self.finish_poll(&mut ops, &module_id, sensor_type, group);
        }
        self.buffer.push_all(ops);
    }

    /// Merge the reading into its poll group. Returns a finished group when
    /// the channel set is complete or a newer poll displaced it.
    fn absorb_into_poll(
        &self,
        state: &mut WriterState,
        reading: &SensorReading,
    ) -> Option<(String, SensorType, PollGroup)> {
        let key = (reading.module_id.clone(), reading.sensor_type);
        let expected = self.expected_channels.get(&key).copied();
        let mut displaced = None;

        let group = state.polls.entry(key.clone()).or_insert_with(|| PollGroup {
            timestamp: reading.timestamp,
            values: BTreeMap::new(),
        });
        if group.timestamp != reading.timestamp {
            displaced = Some(std::mem::replace(
                group,
                PollGroup {
                    timestamp: reading.timestamp,
                    values: BTreeMap::new(),
                },
            ));
        }
        let group = state.polls.get_mut(&key).expect("group just inserted");
        group.values.insert(reading.channel, reading.value);

        if let Some(displaced) = displaced {
            let (module_id, sensor_type) = key;
            return Some((module_id, sensor_type, displaced));
        }
        if let Some(expected) = expected {
            if group.values.len() >= usize::from(expected) {
                let group = state.polls.remove(&key).expect("complete group present");
                let (module_id, sensor_type) = key;
                return Some((module_id, sensor_type, group));
            }
        }
        state
            .latest
            .entry(reading.sensor_type)
            .or_default()
            .insert(reading.channel, reading.value);
        None
    }

    /// Emit the history entry and refreshed statistics hash for a poll.
    fn finish_poll(
        &self,
        ops: &mut Vec<CacheOp>,
        module_id: &str,
        sensor_type: SensorType,
        group: PollGroup,
    ) {
        if group.values.is_empty() {
            return;
        }
        self.polls_completed.fetch_add(1, Ordering::Relaxed);

        let values: Vec<f64> = group.values.values().copied().collect();
        let entry = json!({ "timestamp": group.timestamp, "values": values });
        ops.push(CacheOp::ListPushTrim {
            key: self.keyspace.history(sensor_type, module_id),
            value: Bytes::from(entry.to_string()),
            max_len: self.config.history_max_len,
        });

        let latest = {
            let mut state = self.state.lock();
            let latest = state.latest.entry(sensor_type).or_default();
            latest.extend(group.values.iter().map(|(c, v)| (*c, *v)));
            latest.clone()
        };
        if let Some(fields) = statistics_fields(&latest, group.timestamp) {
            ops.push(CacheOp::HashSetAll {
                key: self.keyspace.statistics(sensor_type),
                fields,
                ttl_secs: None,
            });
        }
    }
}

/// Statistics hash fields from the latest per-channel values.
fn statistics_fields(
    latest: &BTreeMap<u16, f64>,
    timestamp: i64,
) -> Option<Vec<(String, Bytes)>> {
    let (&first_channel, &first_value) = latest.iter().next()?;
    let mut min = (first_channel, first_value);
    let mut max = (first_channel, first_value);
    let mut sum = 0.0;
    for (&channel, &value) in latest {
        if value < min.1 {
            min = (channel, value);
        }
        if value > max.1 {
            max = (channel, value);
        }
        sum += value;
    }
    let avg = sum / latest.len() as f64;

    let mut fields: Vec<(String, Bytes)> = vec![
        ("last_update".into(), Bytes::from(timestamp.to_string())),
        ("channel_count".into(), Bytes::from(latest.len().to_string())),
        ("min".into(), Bytes::from(format!("{:.1}", min.1))),
        ("max".into(), Bytes::from(format!("{:.1}", max.1))),
        ("avg".into(), Bytes::from(format!("{avg:.1}"))),
        ("channel_min".into(), Bytes::from(format!("{:02}", min.0))),
        ("channel_max".into(), Bytes::from(format!("{:02}", max.0))),
    ];
    for (channel, value) in latest {
        fields.push((
            format!("channel_{channel:02}"),
            Bytes::from(format!("{value:.1}")),
        ));
    }
    Some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use enviro_rtdb::{Cache, MemoryCache};

    fn reading(channel: u16, timestamp: i64, raw: u16, value: f64) -> SensorReading {
        SensorReading::new(
            "temp_module_01",
            SensorType::Temperature,
            channel,
            timestamp,
            raw,
            value,
            "20240101_000000",
        )
    }

    fn writer() -> CacheWriter {
        let mut writer = CacheWriter::new(KeySpace::flat(), CacheWriterConfig::default());
        writer.expect_channels("temp_module_01", SensorType::Temperature, 2);
        writer
    }

    #[tokio::test]
    async fn one_poll_produces_all_three_families() {
        let writer = writer();
        let cache = MemoryCache::new();

        writer.handle(&reading(1, 1000, 250, 25.0));
        writer.handle(&reading(2, 1000, 0xFFEC, -2.0));
        writer.buffer().flush(&cache).await.unwrap();

        // Realtime hash per sensor, six fields, TTL refreshed
        let rt = cache
            .hash_get_all("sensor:temperature:temperature_temp_module_01_01:realtime")
            .await
            .unwrap();
        assert_eq!(rt.len(), 6);
        assert_eq!(rt.get("value"), Some(&Bytes::from("25")));
        assert_eq!(rt.get("raw"), Some(&Bytes::from("250")));
        assert_eq!(
            cache.ttl_of("sensor:temperature:temperature_temp_module_01_01:realtime"),
            Some(3600)
        );

        // One history entry carrying both values
        let history = cache
            .list_range("sensor:temperature:temp_module_01:history", 0, -1)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        let entry: serde_json::Value = serde_json::from_slice(&history[0]).unwrap();
        assert_eq!(entry["values"], serde_json::json!([25.0, -2.0]));
        assert_eq!(entry["timestamp"], serde_json::json!(1000));

        // Timeseries member per sensor with counter suffix
        let ts = cache
            .zset_range_by_score(
                "sensor:temperature:temperature_temp_module_01_01:timeseries",
                0.0,
                true,
                10,
            )
            .await
            .unwrap();
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].0, "25:1");

        // Statistics hash for the type
        let stats = cache
            .hash_get_all("sensor:temperature:statistics")
            .await
            .unwrap();
        assert_eq!(stats.get("min"), Some(&Bytes::from("-2.0")));
        assert_eq!(stats.get("max"), Some(&Bytes::from("25.0")));
        assert_eq!(stats.get("avg"), Some(&Bytes::from("11.5")));
        assert_eq!(stats.get("channel_min"), Some(&Bytes::from("02")));
        assert_eq!(stats.get("channel_max"), Some(&Bytes::from("01")));
        assert_eq!(stats.get("channel_01"), Some(&Bytes::from("25.0")));
    }

    #[tokio::test]
    async fn realtime_hash_tracks_latest_write() {
        let writer = writer();
        let cache = MemoryCache::new();

        for ts in [1000, 2000, 3000] {
            writer.handle(&reading(1, ts, 250, 25.0));
            writer.handle(&reading(2, ts, 260, 26.0));
        }
        writer.buffer().flush(&cache).await.unwrap();

        let rt = cache
            .hash_get_all("sensor:temperature:temperature_temp_module_01_01:realtime")
            .await
            .unwrap();
        assert_eq!(rt.get("timestamp"), Some(&Bytes::from("3000")));

        let history = cache
            .list_range("sensor:temperature:temp_module_01:history", 0, -1)
            .await
            .unwrap();
        assert_eq!(history.len(), 3);

        // Counter keeps identical values distinct in the sorted set
        let ts = cache
            .zset_range_by_score(
                "sensor:temperature:temperature_temp_module_01_01:timeseries",
                0.0,
                true,
                100,
            )
            .await
            .unwrap();
        assert_eq!(ts.len(), 3);
        assert_eq!(ts[0].0, "25:1");
        assert_eq!(ts[2].0, "25:3");
    }

    #[tokio::test]
    async fn stale_incomplete_poll_is_flushed() {
        let writer = writer();
        let cache = MemoryCache::new();

        // Channel 2 never arrives (dropped by the decoder)
        writer.handle(&reading(1, 1000, 250, 25.0));
        writer.flush_stale(1000 + 5000);
        writer.buffer().flush(&cache).await.unwrap();

        let history = cache
            .list_range("sensor:temperature:temp_module_01:history", 0, -1)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        let entry: serde_json::Value = serde_json::from_slice(&history[0]).unwrap();
        assert_eq!(entry["values"], serde_json::json!([25.0]));
    }

    #[tokio::test]
    async fn displaced_poll_completes_on_next_timestamp() {
        let mut writer = CacheWriter::new(KeySpace::flat(), CacheWriterConfig::default());
        // No expected channel count registered: completion happens only by
        // displacement or staleness
        writer.expect_channels("other", SensorType::Humidity, 1);
        let cache = MemoryCache::new();

        writer.handle(&reading(1, 1000, 250, 25.0));
        writer.handle(&reading(2, 1000, 260, 26.0));
        writer.handle(&reading(1, 2000, 250, 25.0));
        writer.buffer().flush(&cache).await.unwrap();

        let history = cache
            .list_range("sensor:temperature:temp_module_01:history", 0, -1)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        let entry: serde_json::Value = serde_json::from_slice(&history[0]).unwrap();
        assert_eq!(entry["timestamp"], serde_json::json!(1000));
        assert_eq!(entry["values"], serde_json::json!([25.0, 26.0]));
    }
}
