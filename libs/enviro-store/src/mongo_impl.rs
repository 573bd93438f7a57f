//! MongoDB implementation of the DocStore trait

use crate::documents;
use crate::traits::DocStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::options::{ClientOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, Database, IndexModel};
use std::time::Duration;
use tracing::{debug, warn};

/// MongoDB-backed document tier.
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Connect with a short server-selection timeout and verify liveness.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .context("invalid MongoDB URI")?;
        options.server_selection_timeout = Some(Duration::from_secs(5));
        options.app_name = Some("envirodas".to_string());
        let client = Client::with_options(options).context("MongoDB client setup failed")?;
        let store = Self {
            db: client.database(database),
        };
        store.ping().await?;
        Ok(store)
    }

    fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

#[async_trait]
impl DocStore for MongoStore {
    async fn ping(&self) -> Result<()> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .context("MongoDB ping failed")?;
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        for spec in documents::indexes() {
            let options = IndexOptions::builder().unique(spec.unique).build();
            let model = IndexModel::builder()
                .keys(spec.keys.clone())
                .options(options)
                .build();
            self.collection(&spec.collection)
                .create_index(model, None)
                .await
                .with_context(|| format!("index creation failed on {}", spec.collection))?;
            debug!(collection = %spec.collection, unique = spec.unique, "index ensured");
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, filter: Document, update: Document) -> Result<()> {
        let options = UpdateOptions::builder().upsert(true).build();
        self.collection(collection)
            .update_one(filter, doc! { "$set": update }, options)
            .await
            .with_context(|| format!("upsert failed on {collection}"))?;
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        writes: Vec<(Document, Document)>,
    ) -> Result<usize> {
        // The driver has no cross-document upsert batch; issue them
        // individually and keep going past per-document failures so one bad
        // record cannot poison the batch.
        let coll = self.collection(collection);
        let options = UpdateOptions::builder().upsert(true).build();
        let mut applied = 0;
        let mut last_error = None;
        for (filter, update) in writes {
            match coll
                .update_one(filter, doc! { "$set": update }, options.clone())
                .await
            {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(collection, error = %e, "bulk upsert write failed");
                    last_error = Some(e);
                }
            }
        }
        if applied == 0 {
            if let Some(e) = last_error {
                return Err(e).context(format!("bulk upsert failed on {collection}"));
            }
        }
        Ok(applied)
    }

    async fn find_one(&self, collection: &str, filter: Document) -> Result<Option<Document>> {
        self.collection(collection)
            .find_one(filter, None)
            .await
            .with_context(|| format!("find_one failed on {collection}"))
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64> {
        self.collection(collection)
            .count_documents(filter, None)
            .await
            .with_context(|| format!("count failed on {collection}"))
    }
}
