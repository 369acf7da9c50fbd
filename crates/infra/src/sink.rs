//! Storage sink: the single write path from the pipeline into the store.

use std::sync::Arc;

use tracing::{debug, warn};

use streamer_core::{CallStart, WorkerId};

use crate::store::{DocumentStore, StoreError};

/// Persists extracted records for one pipeline instance.
///
/// Cloning shares the underlying store handle.
#[derive(Clone)]
pub struct StorageSink {
    worker: WorkerId,
    store: Arc<dyn DocumentStore>,
}

impl StorageSink {
    pub fn new(worker: WorkerId, store: Arc<dyn DocumentStore>) -> Self {
        Self { worker, store }
    }

    /// One insert attempt. The store's fault is returned unmodified.
    pub async fn store(&self, record: &CallStart) -> Result<(), StoreError> {
        match self.store.insert_one(record).await {
            Ok(()) => {
                debug!(worker = %self.worker, call_id = %record.call_id(), "record stored");
                Ok(())
            }
            Err(err) => {
                warn!(
                    worker = %self.worker,
                    call_id = %record.call_id(),
                    error = %err,
                    "failed to store record"
                );
                Err(err)
            }
        }
    }
}

impl core::fmt::Debug for StorageSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StorageSink")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use serde_json::json;

    #[tokio::test]
    async fn propagates_store_faults_unmodified() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let sink = StorageSink::new(WorkerId::new(0), store.clone());
        let record = CallStart::from_document(json!({"call_id": 7})).unwrap();

        store.fail_next(1);
        let err = sink.store(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Insert { ref reason, .. } if reason == "injected insert failure"));

        sink.store(&record).await.unwrap();
        assert_eq!(store.records(), vec![record]);
    }
}
