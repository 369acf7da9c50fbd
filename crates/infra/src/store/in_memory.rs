use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::time::Instant;

use streamer_core::{CallId, CallStart};

use super::r#trait::{DocumentStore, StoreError};

/// In-memory document store.
///
/// Intended for tests/dev. Failures can be injected to exercise the retry
/// paths; every insert attempt is timestamped with the tokio clock so tests
/// running on a paused clock can assert on delays.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    records: Vec<CallStart>,
    attempts: Vec<(CallId, Instant)>,
    failing_inserts: u32,
    always_fail: bool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` inserts fail.
    pub fn fail_next(&self, n: u32) {
        self.lock().failing_inserts = n;
    }

    /// Make every insert fail until turned off again.
    pub fn set_always_fail(&self, on: bool) {
        self.lock().always_fail = on;
    }

    pub fn records(&self) -> Vec<CallStart> {
        self.lock().records.clone()
    }

    pub fn count_for(&self, call_id: &CallId) -> usize {
        self.lock()
            .records
            .iter()
            .filter(|r| r.call_id() == call_id)
            .count()
    }

    /// Number of insert attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts.len()
    }

    /// When each attempt for `call_id` happened, oldest first.
    pub fn attempt_times(&self, call_id: &CallId) -> Vec<Instant> {
        self.lock()
            .attempts
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_one(&self, record: &CallStart) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.attempts.push((record.call_id().clone(), Instant::now()));

        if state.always_fail {
            return Err(StoreError::Insert {
                call_id: record.call_id().clone(),
                reason: "store unavailable".to_string(),
            });
        }
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Insert {
                call_id: record.call_id().clone(),
                reason: "injected insert failure".to_string(),
            });
        }

        state.records.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> CallStart {
        CallStart::from_document(json!({"call_id": id, "agent": "a-1"})).unwrap()
    }

    #[tokio::test]
    async fn stores_records_verbatim() {
        let store = InMemoryDocumentStore::new();
        store.insert_one(&record("c-1")).await.unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].document()["agent"], "a-1");
        assert_eq!(store.count_for(&"c-1".parse().unwrap()), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = InMemoryDocumentStore::new();
        store.fail_next(2);

        assert!(store.insert_one(&record("c-1")).await.is_err());
        assert!(store.insert_one(&record("c-1")).await.is_err());
        store.insert_one(&record("c-1")).await.unwrap();

        assert_eq!(store.attempts(), 3);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn always_fail_rejects_until_cleared() {
        let store = InMemoryDocumentStore::new();
        store.set_always_fail(true);
        let err = store.insert_one(&record("c-2")).await.unwrap_err();
        assert!(matches!(err, StoreError::Insert { .. }));

        store.set_always_fail(false);
        store.insert_one(&record("c-2")).await.unwrap();
    }
}
