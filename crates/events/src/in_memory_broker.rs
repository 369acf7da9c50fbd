//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, watch};

use crate::broker::{
    Acknowledger, Broker, BrokerError, BrokerSession, Delivery, DeliveryStream, DeliveryTag,
};

/// In-memory queue broker.
///
/// - Competing consumers per queue, FIFO per queue
/// - Unacked deliveries are requeued (at the front) when the connection is severed
/// - Fault injection for connects, subscribes and publishes
///
/// Cloning yields another handle onto the same broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    /// Connection epoch; bumped by [`InMemoryBroker::sever`].
    epoch: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    connect_attempts: u32,
    failing_connects: u32,
    failing_subscribes: HashMap<String, u32>,
    failing_publishes: HashMap<String, u32>,
    last_prefetch: Option<u16>,
}

#[derive(Debug, Default)]
struct QueueState {
    declared: bool,
    ready: VecDeque<Vec<u8>>,
    /// tag -> (epoch of the receiving session, payload)
    unacked: HashMap<u64, (u64, Vec<u8>)>,
    published: Vec<Vec<u8>>,
    acked: u64,
    notify: Arc<Notify>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }
}

impl BrokerState {
    fn queue_mut(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn take_failure(counters: &mut HashMap<String, u32>, queue: &str) -> bool {
        match counters.get_mut(queue) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message on a queue as an external producer would.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = self.shared.lock();
        let q = state.queue_mut(queue);
        q.ready.push_back(payload.into());
        q.notify.notify_one();
    }

    /// Simulate a connection-level failure: every open session is closed and
    /// its unacked deliveries go back to the head of their queue.
    pub fn sever(&self) {
        let mut state = self.shared.lock();
        for q in state.queues.values_mut() {
            let mut requeue: Vec<(u64, Vec<u8>)> = q
                .unacked
                .drain()
                .map(|(tag, (_, payload))| (tag, payload))
                .collect();
            requeue.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, payload) in requeue {
                q.ready.push_front(payload);
            }
        }
        self.shared.epoch.send_modify(|epoch| *epoch += 1);
        for q in state.queues.values() {
            q.notify.notify_waiters();
        }
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.lock().failing_connects = n;
    }

    /// Make the next `n` subscriptions to `queue` fail.
    pub fn fail_next_subscribes(&self, queue: &str, n: u32) {
        self.shared
            .lock()
            .failing_subscribes
            .insert(queue.to_string(), n);
    }

    /// Make the next `n` publishes to `queue` fail.
    pub fn fail_next_publishes(&self, queue: &str, n: u32) {
        self.shared
            .lock()
            .failing_publishes
            .insert(queue.to_string(), n);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().connect_attempts
    }

    pub fn last_prefetch(&self) -> Option<u16> {
        self.shared.lock().last_prefetch
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.shared
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.declared)
    }

    /// Messages waiting for a consumer.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn acked(&self, queue: &str) -> u64 {
        self.shared.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    /// Every payload successfully published to `queue` through a session.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                epoch,
            }),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Session = InMemorySession;

    async fn connect(&self) -> Result<Self::Session, BrokerError> {
        {
            let mut state = self.shared.lock();
            state.connect_attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BrokerError::Connection("connection refused".to_string()));
            }
        }

        Ok(InMemorySession {
            shared: self.shared.clone(),
            epoch: self.shared.current_epoch(),
        })
    }
}

/// A session on an [`InMemoryBroker`]; dies when the broker is severed.
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Shared>,
    epoch: u64,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.shared.current_epoch() != self.epoch {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.lock().queue_mut(queue).declared = true;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.lock().last_prefetch = Some(count);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            if BrokerState::take_failure(&mut state.failing_subscribes, queue) {
                return Err(BrokerError::Subscribe {
                    queue: queue.to_string(),
                    reason: "injected subscribe failure".to_string(),
                });
            }
            if !state.queues.get(queue).is_some_and(|q| q.declared) {
                return Err(BrokerError::Subscribe {
                    queue: queue.to_string(),
                    reason: "NOT_FOUND - no queue".to_string(),
                });
            }
        }

        let cursor = Cursor {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            epoch: self.epoch,
            epoch_rx: self.shared.epoch.subscribe(),
        };

        Ok(futures::stream::unfold(cursor, |mut cursor| async move {
            cursor.next_delivery().await.map(|d| (Ok(d), cursor))
        })
        .boxed())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if BrokerState::take_failure(&mut state.failing_publishes, queue) {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }
        let q = state.queue_mut(queue);
        q.published.push(payload.clone());
        q.ready.push_back(payload);
        q.notify.notify_one();
        Ok(())
    }

    async fn closed(&self) -> BrokerError {
        let mut rx = self.shared.epoch.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != self.epoch {
                return BrokerError::Connection("connection severed".to_string());
            }
            if rx.changed().await.is_err() {
                return BrokerError::Closed;
            }
        }
    }
}

/// Consumer-side position on one queue.
struct Cursor {
    shared: Arc<Shared>,
    queue: String,
    epoch: u64,
    epoch_rx: watch::Receiver<u64>,
}

impl Cursor {
    /// Wait for the next message; `None` once the session is severed.
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            if *self.epoch_rx.borrow_and_update() != self.epoch {
                return None;
            }

            let notify = {
                let mut state = self.shared.lock();
                state.next_tag += 1;
                let tag = state.next_tag;
                let q = state.queue_mut(&self.queue);
                match q.ready.pop_front() {
                    Some(payload) => {
                        q.unacked.insert(tag, (self.epoch, payload.clone()));
                        let acker = InMemoryAcker {
                            shared: self.shared.clone(),
                            queue: self.queue.clone(),
                            epoch: self.epoch,
                        };
                        return Some(Delivery::new(
                            DeliveryTag::new(tag),
                            self.queue.clone(),
                            payload,
                            Box::new(acker),
                        ));
                    }
                    None => q.notify.clone(),
                }
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = self.epoch_rx.changed() => {}
            }
        }
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    epoch: u64,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        let q = state.queue_mut(&self.queue);
        match q.unacked.get(&tag.value()) {
            Some((epoch, _)) if *epoch == self.epoch => {
                q.unacked.remove(&tag.value());
                q.acked += 1;
                Ok(())
            }
            _ => Err(BrokerError::Ack {
                tag,
                reason: "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open(broker: &InMemoryBroker, queue: &str) -> InMemorySession {
        let session = broker.connect().await.unwrap();
        session.declare_queue(queue).await.unwrap();
        session
    }

    #[tokio::test]
    async fn delivers_fifo_and_tracks_acks() {
        let broker = InMemoryBroker::new();
        let session = open(&broker, "q").await;
        broker.enqueue("q", b"one".to_vec());
        broker.enqueue("q", b"two".to_vec());

        let mut stream = session.subscribe("q", "c").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert_eq!(first.payload(), b"one");
        assert_eq!(second.payload(), b"two");
        assert_eq!(broker.unacked_len("q"), 2);

        first.ack().await.unwrap();
        second.ack().await.unwrap();
        assert_eq!(broker.unacked_len("q"), 0);
        assert_eq!(broker.acked("q"), 2);
    }

    #[tokio::test]
    async fn wakes_consumer_on_publish() {
        let broker = InMemoryBroker::new();
        let session = open(&broker, "q").await;
        let mut stream = session.subscribe("q", "c").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.enqueue("q", b"late".to_vec());
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload(), b"late");
    }

    #[tokio::test]
    async fn sever_requeues_unacked_and_ends_streams() {
        let broker = InMemoryBroker::new();
        let session = open(&broker, "q").await;
        broker.enqueue("q", b"a".to_vec());
        broker.enqueue("q", b"b".to_vec());

        let mut stream = session.subscribe("q", "c").await.unwrap();
        let a = stream.next().await.unwrap().unwrap();

        broker.sever();

        assert!(stream.next().await.is_none());
        assert!(a.ack().await.is_err());
        assert_eq!(broker.ready_len("q"), 2);
        assert!(session.closed().await.is_connection_fault());
        assert!(session.publish("q", b"c".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_requires_declared_queue() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();

        let err = session.subscribe("missing", "c").await.err().unwrap();
        assert!(matches!(err, BrokerError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());

        let session = open(&broker, "q").await;
        broker.fail_next_publishes("q", 1);
        assert!(session.publish("q", b"x".to_vec()).await.is_err());
        session.publish("q", b"y".to_vec()).await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.published("q"), vec![b"y".to_vec()]);
    }
}
