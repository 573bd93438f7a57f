//! EnviroDAS acquisition service
//!
//! Polls field I/O modules over Modbus RTU-over-TCP, decodes register
//! payloads into typed readings and fans them into the cache and document
//! tiers. One task per module reader, one batcher per storage tier, a
//! single cancellation token for shutdown.

pub mod bus;
pub mod cache_writer;
pub mod decoder;
pub mod doc_writer;
pub mod manager;
pub mod orchestrator;
pub mod reader;
pub mod reconnect;

pub use bus::SampleBus;
pub use decoder::{DecodeError, ModuleDecoder};
pub use manager::{ManagerStats, ModuleManager};
pub use orchestrator::Orchestrator;
pub use reader::{ReaderState, ReaderStatus};
pub use reconnect::Backoff;
