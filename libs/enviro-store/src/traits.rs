//! Document store trait definitions

use anyhow::Result;
use async_trait::async_trait;
use bson::Document;

/// Unified document-tier storage trait.
///
/// All writes are upserts keyed by the collection's natural key; the
/// `update` document holds the fields applied via `$set`, so conflicting
/// writes resolve last-writer-wins and replays are idempotent.
///
/// Implementations:
/// - `MongoStore`: production MongoDB backend
/// - `MemoryStore`: in-memory backend for testing
#[async_trait]
pub trait DocStore: Send + Sync + 'static {
    /// Liveness probe; used for fail-fast startup.
    async fn ping(&self) -> Result<()>;

    /// Create the unique and secondary indexes the collections require.
    async fn ensure_indexes(&self) -> Result<()>;

    /// Upsert one document: `$set` `update` on the document matching
    /// `filter`, inserting `filter ∪ update` when none exists.
    async fn upsert(&self, collection: &str, filter: Document, update: Document) -> Result<()>;

    /// Unordered bulk upsert; returns the number of writes applied.
    /// One failing write does not abort the rest.
    async fn bulk_upsert(
        &self,
        collection: &str,
        writes: Vec<(Document, Document)>,
    ) -> Result<usize>;

    async fn find_one(&self, collection: &str, filter: Document) -> Result<Option<Document>>;

    async fn count(&self, collection: &str, filter: Document) -> Result<u64>;
}
