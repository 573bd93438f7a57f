//! Collection names, natural keys and document builders
//!
//! Each builder returns `(filter, update)`: the natural-key filter and the
//! `$set` payload. `synced_at` is stamped on every write and is the only
//! field that differs when a batch is replayed.

use bson::{doc, Bson, Document};
use enviro_model::{DataKind, SensorType};
use std::collections::BTreeMap;

/// Ledger of records already replicated (dedup for realtime/historical/statistics).
pub const SYNC_STATUS: &str = "sync_status";
/// Ledger of positional progress (counts, sorted-set scores).
pub const SYNC_PROGRESS: &str = "sync_progress";

pub fn realtime_collection(ty: SensorType) -> String {
    format!("realtime_{}", ty.as_str())
}

pub fn historical_collection(ty: SensorType) -> String {
    format!("historical_{}", ty.as_str())
}

pub fn timeseries_collection(ty: SensorType) -> String {
    format!("timeseries_{}", ty.as_str())
}

pub fn statistics_collection(ty: SensorType) -> String {
    format!("statistics_{}", ty.as_str())
}

pub fn collection_for(kind: DataKind, ty: SensorType) -> String {
    match kind {
        DataKind::Realtime => realtime_collection(ty),
        DataKind::History => historical_collection(ty),
        DataKind::Timeseries => timeseries_collection(ty),
        DataKind::Statistics => statistics_collection(ty),
    }
}

/// `channel_NN` field name.
pub fn channel_field(channel: u16) -> String {
    format!("channel_{channel:02}")
}

fn synced_at() -> Bson {
    Bson::DateTime(bson::DateTime::now())
}

/// One channel's contribution to a realtime document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    pub value: f64,
    /// Register word; absent for legacy records that only kept values.
    pub raw: Option<i64>,
}

/// `realtime_{type}`, keyed by `session_prefix`.
///
/// Channels land under dotted paths so partial updates merge into the
/// session document instead of erasing sibling channels.
pub fn realtime_write(
    session: &str,
    timestamp: i64,
    channels: &BTreeMap<u16, ChannelSample>,
) -> (Document, Document) {
    let filter = doc! { "session_prefix": session };
    let mut update = doc! {
        "timestamp": timestamp,
        "channel_count": channels.len() as i64,
        "synced_at": synced_at(),
    };
    for (channel, sample) in channels {
        let mut entry = doc! { "value": sample.value };
        if let Some(raw) = sample.raw {
            entry.insert("raw", raw);
        }
        update.insert(format!("channels.{}", channel_field(*channel)), entry);
    }
    (filter, update)
}

/// `historical_{type}`, keyed by `(session_prefix, timestamp)`.
pub fn historical_write(session: &str, timestamp: i64, values: &[f64]) -> (Document, Document) {
    let filter = doc! { "session_prefix": session, "timestamp": timestamp };
    let update = doc! {
        "values": values.to_vec(),
        "channel_count": values.len() as i64,
        "synced_at": synced_at(),
    };
    (filter, update)
}

/// `timeseries_{type}`, keyed by `(session_prefix, channel, timestamp_unix)`.
pub fn timeseries_write(
    session: &str,
    channel: u16,
    timestamp_unix: f64,
    value: f64,
) -> (Document, Document) {
    let filter = doc! {
        "session_prefix": session,
        "channel": i64::from(channel),
        "timestamp_unix": timestamp_unix,
    };
    let update = doc! {
        "timestamp": (timestamp_unix * 1000.0) as i64,
        "value": value,
        "synced_at": synced_at(),
    };
    (filter, update)
}

/// Session-wide statistics snapshot for one sensor type.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub channel_min: u16,
    pub channel_max: u16,
    pub last_update: i64,
    /// Last value per channel.
    pub channels: BTreeMap<u16, f64>,
}

/// `statistics_{type}`, keyed by `session_prefix`.
pub fn statistics_write(session: &str, summary: &StatisticsSummary) -> (Document, Document) {
    let filter = doc! { "session_prefix": session };
    let mut channels = Document::new();
    for (channel, value) in &summary.channels {
        channels.insert(channel_field(*channel), *value);
    }
    let update = doc! {
        "last_update": summary.last_update,
        "channel_count": summary.channels.len() as i64,
        "statistics": {
            "min": summary.min,
            "max": summary.max,
            "avg": summary.avg,
            "channel_min": channel_field(summary.channel_min),
            "channel_max": channel_field(summary.channel_max),
        },
        "channels": channels,
        "synced_at": synced_at(),
    };
    (filter, update)
}

/// `sync_status` row: last replicated record timestamp for a cache key.
pub fn sync_status_write(data_type: &str, key: &str, timestamp: i64) -> (Document, Document) {
    (
        doc! { "data_type": data_type, "key": key },
        doc! { "timestamp": timestamp, "synced_at": synced_at() },
    )
}

pub fn sync_status_filter(data_type: &str, key: &str) -> Document {
    doc! { "data_type": data_type, "key": key }
}

pub fn sync_progress_filter(data_type: &str, key: &str) -> Document {
    doc! { "data_type": data_type, "key": key }
}

/// `sync_progress` update for list replication: entries seen and the head
/// timestamp at the time of the sync.
pub fn sync_progress_count(count: i64, head_ts: i64) -> Document {
    doc! { "count": count, "head_ts": head_ts, "updated_at": synced_at() }
}

/// `sync_progress` update for sorted-set replication: highest score synced
/// plus the member counter that breaks ties at that score.
pub fn sync_progress_score(count: i64, last_score: f64, tie_seq: i64) -> Document {
    doc! {
        "count": count,
        "last_score": last_score,
        "tie_seq": tie_seq,
        "updated_at": synced_at(),
    }
}

/// Index definition consumed by `DocStore::ensure_indexes`.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub collection: String,
    pub keys: Document,
    pub unique: bool,
}

/// Every index the schema requires: natural keys unique, plus `timestamp`
/// and `(session_prefix, channel)` for range queries.
pub fn indexes() -> Vec<IndexSpec> {
    let mut specs = Vec::new();
    for ty in SensorType::all() {
        specs.push(IndexSpec {
            collection: realtime_collection(ty),
            keys: doc! { "session_prefix": 1 },
            unique: true,
        });
        specs.push(IndexSpec {
            collection: historical_collection(ty),
            keys: doc! { "session_prefix": 1, "timestamp": -1 },
            unique: true,
        });
        specs.push(IndexSpec {
            collection: historical_collection(ty),
            keys: doc! { "timestamp": -1 },
            unique: false,
        });
        specs.push(IndexSpec {
            collection: timeseries_collection(ty),
            keys: doc! { "session_prefix": 1, "channel": 1, "timestamp_unix": 1 },
            unique: true,
        });
        specs.push(IndexSpec {
            collection: timeseries_collection(ty),
            keys: doc! { "session_prefix": 1, "channel": 1 },
            unique: false,
        });
        specs.push(IndexSpec {
            collection: timeseries_collection(ty),
            keys: doc! { "timestamp": -1 },
            unique: false,
        });
        specs.push(IndexSpec {
            collection: statistics_collection(ty),
            keys: doc! { "session_prefix": 1 },
            unique: true,
        });
    }
    for ledger in [SYNC_STATUS, SYNC_PROGRESS] {
        specs.push(IndexSpec {
            collection: ledger.to_string(),
            keys: doc! { "data_type": 1, "key": 1 },
            unique: true,
        });
    }
    specs
}
