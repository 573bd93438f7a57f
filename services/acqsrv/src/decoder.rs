//! Decoder registry
//!
//! Maps `(sensor type, is_rtc, conversion)` to pure `u16 -> f64` converters,
//! resolved once at configuration load. Unknown conversion kinds are config
//! errors; out-of-range values at runtime drop the sample and bump a counter.

use enviro_config::{ConfigError, ModuleConfig};
use enviro_model::{ConversionSpec, SensorType};
use thiserror::Error;

/// A decoded value violated its validity range.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("decoded value {value} from raw {raw:#06x} outside [{min}, {max}]")]
pub struct DecodeError {
    pub raw: u16,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Pure register-word converter.
#[derive(Debug, Clone, PartialEq)]
enum Converter {
    /// RTC temperature: signed 16-bit tenths of a degree.
    SignedTenths,
    /// Plain temperature: unsigned tenths, valid −50..200 °C.
    PlainTemperature,
    /// Fixed divisor (wind /100, pressure /1000, humidity /100).
    Scaled(f64),
    /// Data-driven linear conversion.
    Linear {
        scale: f64,
        offset: f64,
        signed: bool,
        clamp: Option<[f64; 2]>,
    },
}

impl Converter {
    fn convert(&self, raw: u16) -> Result<f64, DecodeError> {
        match self {
            Converter::SignedTenths => Ok(f64::from(raw as i16) / 10.0),
            Converter::PlainTemperature => {
                let value = f64::from(raw) / 10.0;
                check_range(raw, value, -50.0, 200.0)
            }
            Converter::Scaled(divisor) => Ok(f64::from(raw) / divisor),
            Converter::Linear {
                scale,
                offset,
                signed,
                clamp,
            } => {
                let base = if *signed {
                    f64::from(raw as i16)
                } else {
                    f64::from(raw)
                };
                let value = scale * base + offset;
                match clamp {
                    Some([min, max]) => check_range(raw, value, *min, *max),
                    None => Ok(value),
                }
            }
        }
    }
}

fn check_range(raw: u16, value: f64, min: f64, max: f64) -> Result<f64, DecodeError> {
    if value < min || value > max {
        return Err(DecodeError {
            raw,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn resolve(
    sensor_type: SensorType,
    is_rtc: bool,
    conversion: Option<&ConversionSpec>,
) -> Result<Converter, ConfigError> {
    if let Some(spec) = conversion {
        if !spec.is_known_kind() {
            return Err(ConfigError::Invalid(format!(
                "unknown conversion kind '{}'",
                spec.kind
            )));
        }
        return Ok(Converter::Linear {
            scale: spec.scale,
            offset: spec.offset,
            signed: spec.signed,
            clamp: spec.clamp,
        });
    }
    Ok(match sensor_type {
        SensorType::Temperature if is_rtc => Converter::SignedTenths,
        SensorType::Temperature => Converter::PlainTemperature,
        SensorType::WindSpeed => Converter::Scaled(100.0),
        SensorType::Pressure => Converter::Scaled(1000.0),
        SensorType::Humidity => Converter::Scaled(100.0),
    })
}

/// One channel's decoded result within a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChannel {
    /// 1-based module-local channel number.
    pub channel: u16,
    pub sensor_type: SensorType,
    pub raw: u16,
    pub value: f64,
}

/// Per-module decoder: primary converter plus the paired RTC temperature
/// converter for pressure/humidity modules whose registers interleave
/// `(value, temperature)` pairs.
#[derive(Debug, Clone)]
pub struct ModuleDecoder {
    sensor_type: SensorType,
    channel_count: u16,
    primary: Converter,
    paired_temperature: Option<Converter>,
}

impl ModuleDecoder {
    /// Resolve converters for a module; fails on unknown conversion kinds.
    pub fn for_module(config: &ModuleConfig) -> Result<Self, ConfigError> {
        let primary = resolve(config.sensor_type, config.is_rtc, config.conversion.as_ref())?;
        let paired_temperature = config
            .has_paired_temperature()
            .then(|| Converter::SignedTenths);
        Ok(Self {
            sensor_type: config.sensor_type,
            channel_count: config.channel_count,
            primary,
            paired_temperature,
        })
    }

    pub fn has_paired_temperature(&self) -> bool {
        self.paired_temperature.is_some()
    }

    /// Decode one poll's register window.
    ///
    /// Returns the decoded channels and how many samples were dropped for
    /// range violations.
    pub fn decode(&self, registers: &[u16]) -> (Vec<DecodedChannel>, u64) {
        let mut channels = Vec::with_capacity(usize::from(self.channel_count));
        let mut dropped = 0u64;
        for index in 0..usize::from(self.channel_count) {
            let channel = (index + 1) as u16;
            let (primary_raw, paired_raw) = match &self.paired_temperature {
                Some(_) => (registers[index * 2], Some(registers[index * 2 + 1])),
                None => (registers[index], None),
            };
            match self.primary.convert(primary_raw) {
                Ok(value) => channels.push(DecodedChannel {
                    channel,
                    sensor_type: self.sensor_type,
                    raw: primary_raw,
                    value,
                }),
                Err(e) => {
                    tracing::debug!(channel, error = %e, "sample dropped");
                    dropped += 1;
                }
            }
            if let (Some(converter), Some(raw)) = (&self.paired_temperature, paired_raw) {
                match converter.convert(raw) {
                    Ok(value) => channels.push(DecodedChannel {
                        channel,
                        sensor_type: SensorType::Temperature,
                        raw,
                        value,
                    }),
                    Err(e) => {
                        tracing::debug!(channel, error = %e, "paired sample dropped");
                        dropped += 1;
                    }
                }
            }
        }
        (channels, dropped)
    }
}
