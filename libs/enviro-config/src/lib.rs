//! EnviroDAS configuration
//!
//! Typed configuration for the acquisition and sync services, loaded from
//! YAML with serde defaults and validated before anything starts. All
//! structural problems (bad register windows, unknown conversion kinds,
//! duplicate module ids) are configuration errors at load time, never
//! runtime surprises.

pub mod serde_defaults;

use enviro_model::{ConversionSpec, SensorType};
use serde::{Deserialize, Serialize};
use serde_defaults as d;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Configuration loading/validation error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Maximum modules per deployment.
pub const MAX_MODULES: usize = 16;

/// Top-level configuration shared by acqsrv and syncsrv.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub document_store: StoreConfig,
    /// Session prefix override; defaults to the process start timestamp.
    #[serde(default)]
    pub session_prefix: Option<String>,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Static wiring for one I/O module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    pub module_id: String,
    pub host: String,
    /// 502 for standard gateways, 8234 for the field modules.
    #[serde(default = "d::modbus_port")]
    pub port: u16,
    pub slave_addr: u8,
    /// 3 (holding registers) or 4 (input registers).
    #[serde(default = "d::function_code")]
    pub function_code: u8,
    #[serde(default)]
    pub start_register: u16,
    pub register_count: u16,
    /// Per-module poll cadence; falls back to the acquisition default.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    pub sensor_type: SensorType,
    pub channel_count: u16,
    /// Custom conversion; built-in decoders apply when absent.
    #[serde(default)]
    pub conversion: Option<ConversionSpec>,
    /// Temperature registers are signed tenths when set.
    #[serde(default)]
    pub is_rtc: bool,
}

impl ModuleConfig {
    /// True when registers carry (value, paired RTC temperature) pairs.
    pub fn has_paired_temperature(&self) -> bool {
        matches!(
            self.sensor_type,
            SensorType::Pressure | SensorType::Humidity
        ) && self.register_count >= self.channel_count * 2
    }

    fn validate(&self) -> Result<()> {
        let id = &self.module_id;
        if id.is_empty() {
            return Err(ConfigError::Invalid("empty module_id".into()));
        }
        if !(1..=247).contains(&self.slave_addr) {
            return Err(ConfigError::Invalid(format!(
                "module {id}: slave_addr {} outside 1..=247",
                self.slave_addr
            )));
        }
        if !matches!(self.function_code, 3 | 4) {
            return Err(ConfigError::Invalid(format!(
                "module {id}: function_code {} (expected 3 or 4)",
                self.function_code
            )));
        }
        if !(1..=125).contains(&self.register_count) {
            return Err(ConfigError::Invalid(format!(
                "module {id}: register_count {} outside 1..=125",
                self.register_count
            )));
        }
        if self.channel_count == 0 || self.channel_count > self.register_count {
            return Err(ConfigError::Invalid(format!(
                "module {id}: channel_count {} must be 1..=register_count ({})",
                self.channel_count, self.register_count
            )));
        }
        if let Some(conversion) = &self.conversion {
            if !conversion.is_known_kind() {
                return Err(ConfigError::Invalid(format!(
                    "module {id}: unknown conversion kind '{}'",
                    conversion.kind
                )));
            }
            if let Some([min, max]) = conversion.clamp {
                if min > max {
                    return Err(ConfigError::Invalid(format!(
                        "module {id}: conversion clamp [{min}, {max}] is inverted"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Cache tier (Redis) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "d::localhost")]
    pub host: String,
    #[serde(default = "d::redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "d::pool_size")]
    pub pool_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: d::localhost(),
            port: d::redis_port(),
            db: 0,
            password: None,
            pool_size: d::pool_size(),
        }
    }
}

impl CacheConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Document tier (MongoDB) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "d::mongo_uri")]
    pub uri: String,
    #[serde(default = "d::mongo_database")]
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: d::mongo_uri(),
            database: d::mongo_database(),
        }
    }
}

/// Acquisition engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionConfig {
    #[serde(default = "d::poll_interval_ms")]
    pub default_poll_interval_ms: u64,
    #[serde(default = "d::read_timeout_ms")]
    pub default_read_timeout_ms: u64,
    #[serde(default = "d::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Consecutive failures before the reader reconnects.
    #[serde(default = "d::failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub reconnect_backoff: BackoffConfig,
    /// Fan-in buffer capacity; overflow drops the oldest sample.
    #[serde(default = "d::fanin_capacity")]
    pub fanin_capacity: usize,
    /// Grace period for stop_all before readers are force-closed.
    #[serde(default = "d::stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_ms: d::poll_interval_ms(),
            default_read_timeout_ms: d::read_timeout_ms(),
            connect_timeout_ms: d::connect_timeout_ms(),
            failure_threshold: d::failure_threshold(),
            reconnect_backoff: BackoffConfig::default(),
            fanin_capacity: d::fanin_capacity(),
            stop_grace_ms: d::stop_grace_ms(),
        }
    }
}

/// Exponential reconnect backoff bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "d::backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "d::backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "d::backoff_multiplier")]
    pub multiplier: f64,
    /// Jitter as a percentage of the delay (±).
    #[serde(default = "d::backoff_jitter_pct")]
    pub jitter_pct: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: d::backoff_initial_ms(),
            max_ms: d::backoff_max_ms(),
            multiplier: d::backoff_multiplier(),
            jitter_pct: d::backoff_jitter_pct(),
        }
    }
}

/// Cache-to-document sync tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Run the sync workers inside the acquisition process.
    #[serde(default)]
    pub embedded: bool,
    #[serde(default = "d::realtime_period_ms")]
    pub realtime_period_ms: u64,
    #[serde(default = "d::historical_period_ms")]
    pub historical_period_ms: u64,
    #[serde(default = "d::timeseries_period_ms")]
    pub timeseries_period_ms: u64,
    #[serde(default = "d::statistics_period_ms")]
    pub statistics_period_ms: u64,
    #[serde(default = "d::page_size")]
    pub page_size: usize,
    /// Upper bound on the work done in one cycle.
    #[serde(default = "d::cycle_deadline_ms")]
    pub cycle_deadline_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            embedded: false,
            realtime_period_ms: d::realtime_period_ms(),
            historical_period_ms: d::historical_period_ms(),
            timeseries_period_ms: d::timeseries_period_ms(),
            statistics_period_ms: d::statistics_period_ms(),
            page_size: d::page_size(),
            cycle_deadline_ms: d::cycle_deadline_ms(),
        }
    }
}

/// Logging settings, mapped onto `enviro_common::LogConfig` by the binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "d::log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: d::log_level(),
            file: None,
            json: false,
        }
    }
}

impl AppConfig {
    /// Load and validate a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML configuration string.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation, run before anything connects.
    pub fn validate(&self) -> Result<()> {
        if self.modules.len() > MAX_MODULES {
            return Err(ConfigError::Invalid(format!(
                "{} modules configured, at most {MAX_MODULES} supported",
                self.modules.len()
            )));
        }
        let mut seen = HashSet::new();
        for module in &self.modules {
            module.validate()?;
            if !seen.insert(module.module_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate module_id '{}'",
                    module.module_id
                )));
            }
        }
        if let Some(prefix) = &self.session_prefix {
            if !enviro_model::types::is_session_prefix(prefix) {
                return Err(ConfigError::Invalid(format!(
                    "session_prefix '{prefix}' is not YYYYMMDD_HHMMSS"
                )));
            }
        }
        if self.acquisition.reconnect_backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect_backoff.multiplier must be >= 1.0".into(),
            ));
        }
        if self.sync.page_size == 0 {
            return Err(ConfigError::Invalid("sync.page_size must be > 0".into()));
        }
        Ok(())
    }

    /// Effective poll interval for one module.
    pub fn poll_interval_ms(&self, module: &ModuleConfig) -> u64 {
        module
            .poll_interval_ms
            .unwrap_or(self.acquisition.default_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
modules:
  - module_id: temp_module_01
    host: 192.168.0.101
    port: 8234
    slave_addr: 1
    function_code: 4
    start_register: 0
    register_count: 12
    sensor_type: temperature
    channel_count: 12
    is_rtc: true
cache:
  host: localhost
document_store:
  uri: mongodb://localhost:27017
  database: envirodas
"#;

    #[test]
    fn loads_minimal_config() {
        let config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.modules.len(), 1);
        let module = &config.modules[0];
        assert_eq!(module.port, 8234);
        assert_eq!(module.function_code, 4);
        assert!(module.is_rtc);
        assert_eq!(config.poll_interval_ms(module), 1000);
        assert_eq!(config.acquisition.failure_threshold, 3);
        assert_eq!(config.acquisition.reconnect_backoff.initial_ms, 1000);
        assert_eq!(config.acquisition.reconnect_backoff.max_ms, 30_000);
        assert_eq!(config.sync.page_size, 200);
        assert_eq!(config.cache.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn rejects_bad_register_window() {
        let text = MINIMAL.replace("register_count: 12", "register_count: 200");
        assert!(matches!(
            AppConfig::from_yaml_str(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_channel_count_above_register_count() {
        let text = MINIMAL.replace("channel_count: 12", "channel_count: 13");
        assert!(AppConfig::from_yaml_str(&text).is_err());
    }

    #[test]
    fn rejects_bad_function_code() {
        let text = MINIMAL.replace("function_code: 4", "function_code: 6");
        assert!(AppConfig::from_yaml_str(&text).is_err());
    }

    #[test]
    fn rejects_unknown_conversion_kind() {
        let yaml = r#"
modules:
  - module_id: m1
    host: 127.0.0.1
    slave_addr: 1
    register_count: 2
    sensor_type: wind_speed
    channel_count: 2
    conversion:
      kind: cubic
      scale: 0.1
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown conversion kind"));
    }

    #[test]
    fn rejects_duplicate_module_ids() {
        let yaml = r#"
modules:
  - module_id: m1
    host: 127.0.0.1
    slave_addr: 1
    register_count: 2
    sensor_type: humidity
    channel_count: 1
  - module_id: m1
    host: 127.0.0.2
    slave_addr: 2
    register_count: 2
    sensor_type: humidity
    channel_count: 1
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate module_id"));
    }

    #[test]
    fn rejects_bad_session_prefix() {
        let yaml = "session_prefix: not-a-session\n";
        assert!(AppConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn paired_temperature_detection() {
        let yaml = r#"
modules:
  - module_id: hum1
    host: 127.0.0.1
    slave_addr: 1
    register_count: 8
    sensor_type: humidity
    channel_count: 4
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert!(config.modules[0].has_paired_temperature());

        let yaml = yaml.replace("register_count: 8", "register_count: 4");
        let config = AppConfig::from_yaml_str(&yaml).unwrap();
        assert!(!config.modules[0].has_paired_temperature());
    }

    #[test]
    fn cache_url_with_password() {
        let cache = CacheConfig {
            password: Some("secret".into()),
            db: 2,
            ..CacheConfig::default()
        };
        assert_eq!(cache.url(), "redis://:secret@localhost:6379/2");
    }
}
