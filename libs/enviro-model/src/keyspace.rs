//! Cache keyspace
//!
//! Key builders for the current schema and a parser that also understands
//! the legacy per-channel temperature schema, with or without a session
//! prefix. The migrator and the realtime sync consume the parser; the cache
//! writer only ever produces current-schema keys.

use crate::types::{channel_of_sensor_id, is_session_prefix, SensorType};
use std::str::FromStr;

/// The four cache record families and their ledger names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Realtime,
    History,
    Timeseries,
    Statistics,
}

impl DataKind {
    /// `data_type` value used in the `sync_status` / `sync_progress` ledgers.
    pub fn ledger_name(&self) -> &'static str {
        match self {
            DataKind::Realtime => "realtime",
            DataKind::History => "historical",
            DataKind::Timeseries => "timeseries",
            DataKind::Statistics => "statistics",
        }
    }

    pub fn all() -> [DataKind; 4] {
        [
            DataKind::Realtime,
            DataKind::History,
            DataKind::Timeseries,
            DataKind::Statistics,
        ]
    }

    /// SCAN patterns covering current and legacy shapes of this kind.
    pub fn scan_patterns(&self) -> Vec<&'static str> {
        match self {
            DataKind::Realtime => vec![
                "sensor:*:realtime",
                "*:sensor:*:realtime",
                "temperature:realtime",
                "*:temperature:realtime",
            ],
            DataKind::History => vec![
                "sensor:*:history",
                "*:sensor:*:history",
                "temperature:history",
                "*:temperature:history",
            ],
            DataKind::Timeseries => vec![
                "sensor:*:timeseries",
                "*:sensor:*:timeseries",
                "temperature:timeseries:*",
                "*:temperature:timeseries:*",
            ],
            DataKind::Statistics => vec![
                "sensor:*:statistics",
                "*:sensor:*:statistics",
                "temperature:statistics",
                "*:temperature:statistics",
            ],
        }
    }
}

/// Key builder bound to an optional session prefix.
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    session_prefix: Option<String>,
}

impl KeySpace {
    /// Flat keyspace (no session prefix), the single-session default.
    pub fn flat() -> Self {
        Self {
            session_prefix: None,
        }
    }

    /// Keyspace with every key prefixed by the session.
    pub fn with_session(session_prefix: impl Into<String>) -> Self {
        Self {
            session_prefix: Some(session_prefix.into()),
        }
    }

    fn prefixed(&self, rest: String) -> String {
        match &self.session_prefix {
            Some(prefix) => format!("{prefix}:{rest}"),
            None => rest,
        }
    }

    /// `sensor:{type}:{sensor_id}:realtime`
    pub fn realtime(&self, ty: SensorType, sensor_id: &str) -> String {
        self.prefixed(format!("sensor:{}:{}:realtime", ty.as_str(), sensor_id))
    }

    /// `sensor:{type}:{module_id}:history`, one entry per completed poll
    pub fn history(&self, ty: SensorType, module_id: &str) -> String {
        self.prefixed(format!("sensor:{}:{}:history", ty.as_str(), module_id))
    }

    /// `sensor:{type}:{sensor_id}:timeseries`
    pub fn timeseries(&self, ty: SensorType, sensor_id: &str) -> String {
        self.prefixed(format!("sensor:{}:{}:timeseries", ty.as_str(), sensor_id))
    }

    /// `sensor:{type}:statistics`
    pub fn statistics(&self, ty: SensorType) -> String {
        self.prefixed(format!("sensor:{}:statistics", ty.as_str()))
    }
}

/// A cache key decomposed into its meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedKey {
    /// Session prefix embedded in the key, if any.
    pub session: Option<String>,
    pub kind: DataKind,
    pub sensor_type: SensorType,
    /// Sensor id (realtime/timeseries) or module id (history); absent for
    /// statistics and for legacy module-level keys.
    pub id: Option<String>,
    /// Channel number, when derivable from the key.
    pub channel: Option<u16>,
    /// True for legacy `temperature:*` shaped keys.
    pub legacy: bool,
}

/// Decompose a cache key. Returns `None` for keys outside the schema.
pub fn parse_key(key: &str) -> Option<ParsedKey> {
    let mut parts: Vec<&str> = key.split(':').collect();
    let session = if parts.len() > 1 && is_session_prefix(parts[0]) {
        Some(parts.remove(0).to_string())
    } else {
        None
    };

    match parts.as_slice() {
        ["sensor", ty, "statistics"] => Some(ParsedKey {
            session,
            kind: DataKind::Statistics,
            sensor_type: SensorType::from_str(ty).ok()?,
            id: None,
            channel: None,
            legacy: false,
        }),
        ["sensor", ty, id, kind @ ("realtime" | "history" | "timeseries")] => {
            let kind = match *kind {
                "realtime" => DataKind::Realtime,
                "history" => DataKind::History,
                _ => DataKind::Timeseries,
            };
            let channel = if kind == DataKind::History {
                None
            } else {
                channel_of_sensor_id(id)
            };
            Some(ParsedKey {
                session,
                kind,
                sensor_type: SensorType::from_str(ty).ok()?,
                id: Some(id.to_string()),
                channel,
                legacy: false,
            })
        }
        ["temperature", "realtime"] => Some(legacy_key(session, DataKind::Realtime, None)),
        ["temperature", "history"] => Some(legacy_key(session, DataKind::History, None)),
        ["temperature", "statistics"] => Some(legacy_key(session, DataKind::Statistics, None)),
        ["temperature", "timeseries", ch] => {
            let channel: u16 = ch.strip_prefix("channel_")?.parse().ok()?;
            Some(legacy_key(session, DataKind::Timeseries, Some(channel)))
        }
        _ => None,
    }
}

fn legacy_key(session: Option<String>, kind: DataKind, channel: Option<u16>) -> ParsedKey {
    ParsedKey {
        session,
        kind,
        sensor_type: SensorType::Temperature,
        id: None,
        channel,
        legacy: true,
    }
}
