//! Shared infrastructure for EnviroDAS services
//!
//! Provides the common error type, tracing-based logging setup and the
//! time provider abstraction used across the acquisition and sync services.

pub mod error;
pub mod logging;
pub mod time;

pub use error::{Error, Result};
pub use logging::{init_logging, init_test_logging, LogConfig, LogFormat};
pub use time::{FixedTimeProvider, SystemTimeProvider, TimeProvider};
