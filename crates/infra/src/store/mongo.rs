//! MongoDB-backed document store.
//!
//! One client per pipeline instance; the driver pools connections internally
//! (`MAX_POOL_SIZE`). Each record becomes one document in the configured
//! collection via `insertOne`.

use async_trait::async_trait;
use mongodb::bson::{self, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use tracing::{debug, instrument};

use streamer_core::CallStart;

use super::r#trait::{DocumentStore, StoreError};

#[derive(Debug, Clone)]
pub struct MongoDocumentStore {
    collection: Collection<Document>,
}

impl MongoDocumentStore {
    /// Build a client for `url` and bind it to `database.collection`.
    ///
    /// The driver connects lazily; server faults surface on the first insert.
    pub async fn connect(
        url: &str,
        database: &str,
        collection: &str,
        max_pool_size: u32,
    ) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(url)
            .await
            .map_err(|e| StoreError::Connection(format!("invalid MongoDB url: {e}")))?;
        options.max_pool_size = Some(max_pool_size);

        let client = Client::with_options(options)
            .map_err(|e| StoreError::Connection(format!("MongoDB client error: {e}")))?;

        debug!(database, collection, max_pool_size, "MongoDB client ready");

        Ok(Self {
            collection: client.database(database).collection::<Document>(collection),
        })
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    #[instrument(
        skip(self, record),
        fields(call_id = %record.call_id(), collection = %self.collection.name()),
        err
    )]
    async fn insert_one(&self, record: &CallStart) -> Result<(), StoreError> {
        let document = bson::to_document(record.document()).map_err(|e| StoreError::Encode {
            call_id: record.call_id().clone(),
            reason: e.to_string(),
        })?;

        self.collection
            .insert_one(document)
            .await
            .map_err(|e| StoreError::Insert {
                call_id: record.call_id().clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}
