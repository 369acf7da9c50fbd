//! Primary queue consumer.
//!
//! Every delivery gets exactly one storage attempt here. Anything that fails,
//! whether the payload is unreadable or the store refuses it, is handed to the
//! persistent retry queue and the original delivery is acked regardless.

use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use streamer_core::{EnvelopeError, WorkerId};
use streamer_events::{BrokerError, BrokerSession, Delivery, DeliveryStream, Envelope};

use crate::sink::StorageSink;
use crate::stats::PipelineStats;
use crate::store::StoreError;

/// What happened to one primary-queue delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Stored,
    /// Published to the persistent retry queue.
    Escalated,
    /// Could not be stored nor published; the message is lost.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PrimaryConsumer {
    worker: WorkerId,
    queue: String,
    retry_queue: String,
    prefetch: u16,
    sink: StorageSink,
    stats: Arc<PipelineStats>,
}

impl PrimaryConsumer {
    pub fn new(
        worker: WorkerId,
        queue: impl Into<String>,
        retry_queue: impl Into<String>,
        prefetch: u16,
        sink: StorageSink,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            worker,
            queue: queue.into(),
            retry_queue: retry_queue.into(),
            prefetch,
            sink,
            stats,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Apply the prefetch limit and start consuming the primary queue.
    pub async fn subscribe<S>(&self, session: &S) -> Result<DeliveryStream, BrokerError>
    where
        S: BrokerSession + ?Sized,
    {
        session.set_prefetch(self.prefetch).await?;
        let consumer_tag = format!("{}-{}", self.worker, Uuid::now_v7());
        let stream = session.subscribe(&self.queue, &consumer_tag).await?;
        info!(
            worker = %self.worker,
            queue = %self.queue,
            prefetch = self.prefetch,
            consumer_tag = %consumer_tag,
            "consuming primary queue"
        );
        Ok(stream)
    }

    /// Process deliveries, up to `prefetch` at a time, until the stream fails
    /// or ends. Returns the fault that stopped consumption.
    pub async fn consume<S>(&self, session: &S, stream: DeliveryStream) -> BrokerError
    where
        S: BrokerSession + ?Sized,
    {
        let result = stream
            .try_for_each_concurrent(usize::from(self.prefetch), |delivery| async move {
                self.handle(session, delivery).await.map(|_| ())
            })
            .await;

        match result {
            Err(err) => err,
            Ok(()) => BrokerError::Closed,
        }
    }

    /// Store one delivery, escalating it on failure, then ack it.
    ///
    /// Only a failed ack is returned as an error.
    pub async fn handle<S>(
        &self,
        session: &S,
        delivery: Delivery,
    ) -> Result<ConsumeOutcome, BrokerError>
    where
        S: BrokerSession + ?Sized,
    {
        self.stats.record_consumed();

        let decoded = Envelope::decode(delivery.payload());
        let attempt = match &decoded {
            Ok(envelope) => self.attempt(envelope).await,
            Err(err) => Err(AttemptError::Envelope(err.clone())),
        };

        let outcome = match attempt {
            Ok(()) => {
                self.stats.record_stored();
                ConsumeOutcome::Stored
            }
            Err(err) => {
                warn!(
                    worker = %self.worker,
                    queue = %self.queue,
                    tag = %delivery.tag(),
                    error = %err,
                    "primary delivery failed, sending to retry queue"
                );
                let payload = match &decoded {
                    Ok(envelope) => envelope.encode(),
                    Err(_) => Ok(delivery.payload().to_vec()),
                };
                self.escalate(session, payload).await
            }
        };

        delivery.ack().await?;
        Ok(outcome)
    }

    async fn attempt(&self, envelope: &Envelope) -> Result<(), AttemptError> {
        let record = envelope.call_start()?;
        self.sink.store(&record).await?;
        Ok(())
    }

    async fn escalate<S>(
        &self,
        session: &S,
        payload: Result<Vec<u8>, EnvelopeError>,
    ) -> ConsumeOutcome
    where
        S: BrokerSession + ?Sized,
    {
        let published = match payload {
            Ok(bytes) => session
                .publish(&self.retry_queue, bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => {
                debug!(worker = %self.worker, queue = %self.retry_queue, "escalated to retry queue");
                self.stats.record_escalated();
                ConsumeOutcome::Escalated
            }
            Err(reason) => {
                error!(
                    worker = %self.worker,
                    queue = %self.retry_queue,
                    error = %reason,
                    "failed to publish to retry queue, message dropped"
                );
                self.stats.record_dropped();
                ConsumeOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, InMemoryDocumentStore};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use streamer_core::CallStart;
    use streamer_events::{Broker, InMemoryBroker, InMemorySession};

    const PRIMARY: &str = "primary";
    const RETRY: &str = "retry";

    async fn setup() -> (
        InMemoryBroker,
        InMemorySession,
        Arc<InMemoryDocumentStore>,
        PrimaryConsumer,
    ) {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_queue(PRIMARY).await.unwrap();
        session.declare_queue(RETRY).await.unwrap();

        let store = Arc::new(InMemoryDocumentStore::new());
        let worker = WorkerId::new(0);
        let consumer = PrimaryConsumer::new(
            worker,
            PRIMARY,
            RETRY,
            10,
            StorageSink::new(worker, store.clone()),
            Arc::new(PipelineStats::new()),
        );
        (broker, session, store, consumer)
    }

    async fn next_delivery(session: &InMemorySession, consumer: &PrimaryConsumer) -> Delivery {
        let mut stream = consumer.subscribe(session).await.unwrap();
        stream.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn stores_and_acks_valid_delivery() {
        let (broker, session, store, consumer) = setup().await;
        broker.enqueue(PRIMARY, json!({"body": {"call_start": {"call_id": "c-1"}}}).to_string());

        let delivery = next_delivery(&session, &consumer).await;
        let outcome = consumer.handle(&session, delivery).await.unwrap();

        assert_eq!(outcome, ConsumeOutcome::Stored);
        assert_eq!(store.records().len(), 1);
        assert_eq!(broker.acked(PRIMARY), 1);
        assert!(broker.published(RETRY).is_empty());
        assert_eq!(broker.last_prefetch(), Some(10));
    }

    #[tokio::test]
    async fn store_failure_escalates_envelope_and_acks() {
        let (broker, session, store, consumer) = setup().await;
        store.fail_next(1);
        broker.enqueue(
            PRIMARY,
            json!({"body": {"call_start": {"call_id": "c-2"}}, "source": "pbx"}).to_string(),
        );

        let delivery = next_delivery(&session, &consumer).await;
        let outcome = consumer.handle(&session, delivery).await.unwrap();

        assert_eq!(outcome, ConsumeOutcome::Escalated);
        assert_eq!(broker.acked(PRIMARY), 1);
        let published = broker.published(RETRY);
        assert_eq!(published.len(), 1);
        let envelope = Envelope::decode(&published[0]).unwrap();
        assert_eq!(envelope.retry_count(), 0);
        let raw: serde_json::Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(raw["source"], "pbx");
    }

    #[tokio::test]
    async fn missing_call_start_goes_to_retry_queue() {
        let (broker, session, store, consumer) = setup().await;
        broker.enqueue(PRIMARY, json!({"body": {"call_end": {}}}).to_string());

        let delivery = next_delivery(&session, &consumer).await;
        let outcome = consumer.handle(&session, delivery).await.unwrap();

        assert_eq!(outcome, ConsumeOutcome::Escalated);
        assert_eq!(store.attempts(), 0);
        assert_eq!(broker.published(RETRY).len(), 1);
    }

    #[tokio::test]
    async fn unparseable_payload_is_forwarded_raw() {
        let (broker, session, _store, consumer) = setup().await;
        broker.enqueue(PRIMARY, b"not json".to_vec());

        let delivery = next_delivery(&session, &consumer).await;
        consumer.handle(&session, delivery).await.unwrap();

        assert_eq!(broker.published(RETRY), vec![b"not json".to_vec()]);
        assert_eq!(broker.acked(PRIMARY), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_counted_as_drop_and_still_acked() {
        let (broker, session, store, consumer) = setup().await;
        store.set_always_fail(true);
        broker.fail_next_publishes(RETRY, 1);
        broker.enqueue(PRIMARY, json!({"body": {"call_start": {"call_id": "c-3"}}}).to_string());

        let delivery = next_delivery(&session, &consumer).await;
        let outcome = consumer.handle(&session, delivery).await.unwrap();

        assert_eq!(outcome, ConsumeOutcome::Dropped);
        assert_eq!(broker.acked(PRIMARY), 1);
        assert_eq!(consumer.stats.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn consume_returns_fault_when_connection_drops() {
        let (broker, session, store, consumer) = setup().await;
        for i in 0..3 {
            broker.enqueue(
                PRIMARY,
                json!({"body": {"call_start": {"call_id": format!("c-{i}")}}}).to_string(),
            );
        }

        let stream = consumer.subscribe(&session).await.unwrap();
        let severing = broker.clone();
        let watcher = async {
            while store.records().len() < 3 {
                tokio::task::yield_now().await;
            }
            severing.sever();
        };

        let (fault, ()) = tokio::join!(consumer.consume(&session, stream), watcher);

        assert_eq!(fault, BrokerError::Closed);
        assert_eq!(broker.acked(PRIMARY), 3);
    }

    /// Store that takes 10ms per insert and records peak concurrency.
    struct SlowStore {
        broker: InMemoryBroker,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        peak_unacked: AtomicUsize,
        stored: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn insert_one(&self, _record: &CallStart) -> Result<(), StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            self.peak_unacked
                .fetch_max(self.broker.unacked_len(PRIMARY), Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(10)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_deliveries_never_exceed_prefetch() {
        const PREFETCH: u16 = 5;
        const DELIVERIES: usize = 50;

        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_queue(PRIMARY).await.unwrap();
        session.declare_queue(RETRY).await.unwrap();
        for i in 0..DELIVERIES {
            broker.enqueue(
                PRIMARY,
                json!({"body": {"call_start": {"call_id": format!("c-{i}")}}}).to_string(),
            );
        }

        let store = Arc::new(SlowStore {
            broker: broker.clone(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            peak_unacked: AtomicUsize::new(0),
            stored: AtomicUsize::new(0),
        });
        let worker = WorkerId::new(0);
        let consumer = PrimaryConsumer::new(
            worker,
            PRIMARY,
            RETRY,
            PREFETCH,
            StorageSink::new(worker, store.clone()),
            Arc::new(PipelineStats::new()),
        );

        let stream = consumer.subscribe(&session).await.unwrap();
        let watcher = async {
            while store.stored.load(Ordering::SeqCst) < DELIVERIES {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            broker.sever();
        };

        let (fault, ()) = tokio::join!(consumer.consume(&session, stream), watcher);

        assert_eq!(fault, BrokerError::Closed);
        assert_eq!(broker.acked(PRIMARY), DELIVERIES as u64);
        assert_eq!(store.peak_in_flight.load(Ordering::SeqCst), usize::from(PREFETCH));
        assert!(store.peak_unacked.load(Ordering::SeqCst) <= usize::from(PREFETCH));
        assert_eq!(broker.unacked_len(PRIMARY), 0);
    }
}
