//! EnviroDAS domain model
//!
//! Sensor types and readings, the conversion spec format, and the cache
//! keyspace (current and legacy key shapes).

pub mod conversion;
pub mod keyspace;
pub mod types;

pub use conversion::ConversionSpec;
pub use keyspace::{parse_key, DataKind, KeySpace, ParsedKey};
pub use types::{session_prefix, SensorReading, SensorType};
