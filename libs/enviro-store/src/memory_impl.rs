//! In-memory implementation of the DocStore trait
//!
//! Backs the test suite and offline runs. Supports the subset of MongoDB
//! behavior the pipeline relies on: equality filters, `$set` with dotted
//! paths, natural-key upserts.

use crate::traits::DocStore;
use anyhow::Result;
use async_trait::async_trait;
use bson::{Bson, Document};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    writes: AtomicU64,
    inserts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total upsert operations applied (inserts + updates).
    pub fn write_ops(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Documents newly created by upserts.
    pub fn insert_ops(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Snapshot a whole collection (test inspection).
    pub fn dump(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn upsert_locked(
        collections: &mut HashMap<String, Vec<Document>>,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> bool {
        let docs = collections.entry(collection.to_string()).or_default();
        if let Some(existing) = docs.iter_mut().find(|doc| matches_filter(doc, filter)) {
            apply_set(existing, update);
            false
        } else {
            let mut doc = Document::new();
            apply_set(&mut doc, filter);
            apply_set(&mut doc, update);
            docs.push(doc);
            true
        }
    }
}

/// Loose equality: Int32/Int64/Double compare by numeric value, everything
/// else by Bson equality.
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| match lookup_path(doc, key) {
            Some(actual) => bson_eq(actual, expected),
            None => false,
        })
}

fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

/// `$set` semantics including dotted paths.
fn apply_set(doc: &mut Document, update: &Document) {
    for (key, value) in update {
        set_path(doc, key, value.clone());
    }
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        // Uniqueness is enforced by upsert-by-natural-key; nothing to build.
        Ok(())
    }

    async fn upsert(&self, collection: &str, filter: Document, update: Document) -> Result<()> {
        let mut collections = self.collections.lock();
        let inserted = Self::upsert_locked(&mut collections, collection, &filter, &update);
        self.writes.fetch_add(1, Ordering::Relaxed);
        if inserted {
            self.inserts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        writes: Vec<(Document, Document)>,
    ) -> Result<usize> {
        let mut collections = self.collections.lock();
        let mut applied = 0;
        for (filter, update) in writes {
            let inserted = Self::upsert_locked(&mut collections, collection, &filter, &update);
            self.writes.fetch_add(1, Ordering::Relaxed);
            if inserted {
                self.inserts.fetch_add(1, Ordering::Relaxed);
            }
            applied += 1;
        }
        Ok(applied)
    }

    async fn find_one(&self, collection: &str, filter: Document) -> Result<Option<Document>> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| matches_filter(doc, &filter)).cloned()))
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, &filter))
                    .count() as u64
            })
            .unwrap_or(0))
    }
}
