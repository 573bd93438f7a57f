//! Cache record interpretation shared by the migrator and sync workers
//!
//! Handles both current-schema records and the legacy per-channel
//! temperature records, including legacy ISO-8601 timestamps and
//! suffix-less sorted-set members.

use bytes::Bytes;
use chrono::DateTime;
use enviro_store::documents::ChannelSample;
use std::collections::{BTreeMap, HashMap};

/// Timestamp from a cache field: epoch milliseconds, epoch seconds
/// (10-digit), or an ISO-8601 string from the legacy writer.
pub fn parse_timestamp(raw: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    if let Ok(millis) = text.parse::<i64>() {
        // Seconds-resolution legacy values are below any plausible millis
        return Some(if millis < 100_000_000_000 {
            millis * 1000
        } else {
            millis
        });
    }
    if let Ok(seconds) = text.parse::<f64>() {
        return Some((seconds * 1000.0) as i64);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.timestamp_millis())
        .or_else(|| {
            // Python isoformat without offset
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        })
}

fn parse_f64(raw: &[u8]) -> Option<f64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

/// Sorted-set member: `{value}:{seq}` in the current schema, a bare value
/// in legacy data (seq 0).
pub fn parse_member(member: &str) -> Option<(f64, i64)> {
    if let Some((value, seq)) = member.rsplit_once(':') {
        if let (Ok(value), Ok(seq)) = (value.parse::<f64>(), seq.parse::<i64>()) {
            return Some((value, seq));
        }
    }
    member.parse::<f64>().ok().map(|value| (value, 0))
}

/// A realtime hash decoded into channel contributions.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeRecord {
    pub timestamp: i64,
    pub channels: BTreeMap<u16, ChannelSample>,
}

/// Decode a realtime hash of either shape.
///
/// Current schema: one sensor per hash (`value`/`raw`/`channel` fields).
/// Legacy schema: one module per hash (`channel_NN` + `channel_NN_raw`).
pub fn parse_realtime(
    fields: &HashMap<String, Bytes>,
    key_channel: Option<u16>,
) -> Option<RealtimeRecord> {
    let timestamp = parse_timestamp(fields.get("timestamp")?)?;
    let mut channels = BTreeMap::new();

    if let Some(value) = fields.get("value") {
        let channel = fields
            .get("channel")
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|text| text.trim().parse().ok())
            .or(key_channel)?;
        channels.insert(
            channel,
            ChannelSample {
                value: parse_f64(value)?,
                raw: fields
                    .get("raw")
                    .and_then(|raw| parse_f64(raw))
                    .map(|raw| raw as i64),
            },
        );
        return Some(RealtimeRecord {
            timestamp,
            channels,
        });
    }

    for (field, value) in fields {
        let Some(rest) = field.strip_prefix("channel_") else {
            continue;
        };
        if rest.ends_with("_raw") {
            continue;
        }
        let Ok(channel) = rest.parse::<u16>() else {
            continue;
        };
        let Some(value) = parse_f64(value) else {
            continue;
        };
        let raw = fields
            .get(&format!("{field}_raw"))
            .and_then(|raw| parse_f64(raw))
            .map(|raw| raw as i64);
        channels.insert(channel, ChannelSample { value, raw });
    }
    if channels.is_empty() {
        return None;
    }
    Some(RealtimeRecord {
        timestamp,
        channels,
    })
}

/// One history list entry: `{timestamp, values}` in the current schema,
/// `{timestamp, temperatures}` in legacy data.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub values: Vec<f64>,
}

pub fn parse_history_entry(raw: &[u8]) -> Option<HistoryEntry> {
    let json: serde_json::Value = serde_json::from_slice(raw).ok()?;
    let timestamp = match &json["timestamp"] {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => parse_timestamp(s.as_bytes())?,
        _ => return None,
    };
    let values = json
        .get("values")
        .or_else(|| json.get("temperatures"))?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_f64())
        .collect();
    Some(HistoryEntry { timestamp, values })
}

/// Statistics hash decoded for the statistics document.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsRecord {
    pub last_update: i64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub channel_min: u16,
    pub channel_max: u16,
    pub channels: BTreeMap<u16, f64>,
}

pub fn parse_statistics(fields: &HashMap<String, Bytes>) -> Option<StatisticsRecord> {
    let last_update = parse_timestamp(fields.get("last_update")?)?;
    let get = |names: &[&str]| -> Option<f64> {
        names.iter().find_map(|name| fields.get(*name).and_then(|v| parse_f64(v)))
    };
    // Legacy fields carry a _temperature suffix
    let min = get(&["min", "min_temperature"])?;
    let max = get(&["max", "max_temperature"])?;
    let avg = get(&["avg", "avg_temperature"])?;
    let channel_index = |name: &str| -> Option<u16> {
        fields
            .get(name)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|text| text.trim().trim_start_matches("channel_").parse().ok())
    };
    let mut channels = BTreeMap::new();
    for (field, value) in fields {
        let Some(rest) = field.strip_prefix("channel_") else {
            continue;
        };
        if let (Ok(channel), Some(value)) = (rest.parse::<u16>(), parse_f64(value)) {
            channels.insert(channel, value);
        }
    }
    Some(StatisticsRecord {
        last_update,
        min,
        max,
        avg,
        channel_min: channel_index("channel_min").unwrap_or(0),
        channel_max: channel_index("channel_max").unwrap_or(0),
        channels,
    })
}
