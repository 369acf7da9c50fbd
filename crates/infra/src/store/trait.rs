use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use streamer_core::{CallId, CallStart};

/// Document store operation error.
///
/// These are **infrastructure errors**; a record that cannot be extracted from
/// an envelope never reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("failed to insert record {call_id}: {reason}")]
    Insert { call_id: CallId, reason: String },

    #[error("failed to encode record {call_id}: {reason}")]
    Encode { call_id: CallId, reason: String },
}

/// Insert-only store for call records.
///
/// ## Insert Semantics
///
/// `insert_one()`:
/// - Writes the record document verbatim as a single new document
/// - Never updates or upserts; a duplicate `call_id` is the store's business
/// - Returns the store's fault unmodified so callers can decide how to retry
///
/// A store handle is owned by one pipeline instance and may be called
/// concurrently from that instance's in-flight deliveries.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, record: &CallStart) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn insert_one(&self, record: &CallStart) -> Result<(), StoreError> {
        (**self).insert_one(record).await
    }
}
