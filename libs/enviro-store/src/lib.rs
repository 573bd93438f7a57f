//! EnviroDAS document-tier abstraction
//!
//! The durable store keeps long-term records and statistics plus the sync
//! ledgers. Writes are natural-key upserts so replaying a batch is a no-op
//! apart from `synced_at`.
//!
//! # Key components
//!
//! - **DocStore trait**: upsert/find/count over named collections
//! - **MongoStore**: production MongoDB backend
//! - **MemoryStore**: in-memory backend for hermetic tests
//! - **documents**: collection names, natural keys and document builders

pub mod documents;
pub mod memory_impl;
pub mod mongo_impl;
pub mod traits;

pub use bson::{doc, Document};
pub use memory_impl::MemoryStore;
pub use mongo_impl::MongoStore;
pub use traits::DocStore;

use std::sync::Arc;

/// In-memory store for unit tests; no external services required.
pub fn create_test_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}
