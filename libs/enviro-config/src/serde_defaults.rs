//! Serde default value functions for configuration structs
//!
//! Centralized so `#[serde(default = "...")]` attributes across the config
//! structs stay consistent with the documented defaults.

pub fn localhost() -> String {
    "localhost".to_string()
}

pub fn modbus_port() -> u16 {
    502
}

pub fn redis_port() -> u16 {
    6379
}

pub fn pool_size() -> usize {
    4
}

pub fn mongo_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

pub fn mongo_database() -> String {
    "envirodas".to_string()
}

pub fn function_code() -> u8 {
    4
}

pub fn poll_interval_ms() -> u64 {
    1000
}

pub fn read_timeout_ms() -> u64 {
    1000
}

pub fn connect_timeout_ms() -> u64 {
    3000
}

pub fn failure_threshold() -> u32 {
    3
}

pub fn fanin_capacity() -> usize {
    4096
}

pub fn stop_grace_ms() -> u64 {
    5000
}

pub fn backoff_initial_ms() -> u64 {
    1000
}

pub fn backoff_max_ms() -> u64 {
    30_000
}

pub fn backoff_multiplier() -> f64 {
    2.0
}

pub fn backoff_jitter_pct() -> u32 {
    20
}

pub fn realtime_period_ms() -> u64 {
    1000
}

pub fn historical_period_ms() -> u64 {
    5000
}

pub fn timeseries_period_ms() -> u64 {
    2000
}

pub fn statistics_period_ms() -> u64 {
    10_000
}

pub fn page_size() -> usize {
    200
}

pub fn cycle_deadline_ms() -> u64 {
    30_000
}

pub fn log_level() -> String {
    "info".to_string()
}
