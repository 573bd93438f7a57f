//! Sensor types and readings

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of physical quantity a channel measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    WindSpeed,
    Pressure,
    Humidity,
}

impl SensorType {
    /// Stable identifier used in cache keys, collection names and sensor ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::WindSpeed => "wind_speed",
            SensorType::Pressure => "pressure",
            SensorType::Humidity => "humidity",
        }
    }

    /// Engineering unit of the decoded value.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Temperature => "°C",
            SensorType::WindSpeed => "m/s",
            SensorType::Pressure => "kPa",
            SensorType::Humidity => "%RH",
        }
    }

    pub fn all() -> [SensorType; 4] {
        [
            SensorType::Temperature,
            SensorType::WindSpeed,
            SensorType::Pressure,
            SensorType::Humidity,
        ]
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(SensorType::Temperature),
            "wind_speed" => Ok(SensorType::WindSpeed),
            "pressure" => Ok(SensorType::Pressure),
            "humidity" => Ok(SensorType::Humidity),
            other => Err(format!("unknown sensor type: {other}")),
        }
    }
}

/// Globally unique sensor id: `{type}_{module}_{channel:02}`.
///
/// Stable across restarts; the session prefix is not.
pub fn sensor_id(sensor_type: SensorType, module_id: &str, channel: u16) -> String {
    format!("{}_{}_{:02}", sensor_type.as_str(), module_id, channel)
}

/// Channel number encoded in a sensor id, if any.
pub fn channel_of_sensor_id(sensor_id: &str) -> Option<u16> {
    sensor_id.rsplit('_').next()?.parse().ok()
}

/// One decoded sample from one channel at one instant.
///
/// Produced by a module reader, consumed once by the manager fan-out and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub module_id: String,
    pub sensor_type: SensorType,
    pub sensor_id: String,
    pub channel: u16,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Register word prior to conversion.
    pub raw: u16,
    /// Engineering-unit value. NaN only when a failed decode must still be
    /// accounted for; normally the sample is dropped instead.
    pub value: f64,
    pub unit: String,
    /// Groups all samples from one acquisition run (`YYYYMMDD_HHMMSS`).
    pub session_prefix: String,
}

impl SensorReading {
    pub fn new(
        module_id: &str,
        sensor_type: SensorType,
        channel: u16,
        timestamp: i64,
        raw: u16,
        value: f64,
        session_prefix: &str,
    ) -> Self {
        Self {
            module_id: module_id.to_string(),
            sensor_type,
            sensor_id: sensor_id(sensor_type, module_id, channel),
            channel,
            timestamp,
            raw,
            value,
            unit: sensor_type.unit().to_string(),
            session_prefix: session_prefix.to_string(),
        }
    }

    /// Timestamp as unix seconds, the sorted-set score format.
    pub fn timestamp_unix(&self) -> f64 {
        self.timestamp as f64 / 1000.0
    }
}

/// Session prefix for one acquisition run, derived from local time.
pub fn session_prefix(now_millis: i64) -> String {
    let dt: DateTime<Local> = Utc
        .timestamp_millis_opt(now_millis)
        .single()
        .unwrap_or_else(Utc::now)
        .with_timezone(&Local);
    dt.format("%Y%m%d_%H%M%S").to_string()
}

/// True if a key segment looks like a session prefix.
pub fn is_session_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..].iter().all(u8::is_ascii_digit)
}
