//! Message broker abstraction (mechanics only).
//!
//! This module provides the **queue pattern** the pipeline is built on:
//! competing consumers pulling from named queues, with explicit per-delivery
//! acknowledgement.
//!
//! ## Design Philosophy
//!
//! The abstraction is intentionally **lightweight** and makes minimal assumptions:
//!
//! - **Transport-agnostic**: Works with AMQP, an in-memory broker for tests, etc.
//! - **At-least-once delivery**: A delivery that is never acked is redelivered by the
//!   broker (after the connection drops); consumers must tolerate duplicates
//! - **Competing consumers**: Each message on a queue goes to exactly one subscriber
//! - **Explicit acks**: A [`Delivery`] is acked by consuming it, so the tag can be
//!   used at most once
//!
//! ## Connection Lifecycle
//!
//! A [`Broker`] is a factory for [`BrokerSession`]s. A session is one connection plus
//! one channel; it is owned by exactly one pipeline instance and is discarded (never
//! repaired) once [`BrokerSession::closed`] resolves.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Broker-assigned delivery tag, scoped to the channel that received it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("failed to subscribe to queue {queue}: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("failed to publish to queue {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("failed to ack delivery {tag}: {reason}")]
    Ack { tag: DeliveryTag, reason: String },

    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether the error means the session is unusable and must be replaced.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Closed)
    }
}

/// Acknowledges deliveries on the channel they arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;
}

/// A message handed to a subscriber.
///
/// The delivery tag is owned by the consumer that received it and is spent by
/// [`Delivery::ack`].
pub struct Delivery {
    tag: DeliveryTag,
    queue: String,
    payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        tag: DeliveryTag,
        queue: impl Into<String>,
        payload: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag,
            queue: queue.into(),
            payload,
            acker,
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Remove the message from the broker's unacked set permanently.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack(self.tag).await
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries for one subscription.
///
/// The stream ends (or yields an error) when the underlying channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// One broker connection + channel.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a durable queue (idempotent).
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Cap the number of unacknowledged deliveries per subscription.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start consuming from `queue`.
    async fn subscribe(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    /// Publish a payload to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Resolves once the connection reports an error.
    ///
    /// The returned error describes the fault; the session must not be used
    /// afterwards.
    async fn closed(&self) -> BrokerError;
}

/// Factory for broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    type Session: BrokerSession + 'static;

    /// Open a connection and a channel on it.
    async fn connect(&self) -> Result<Self::Session, BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    type Session = B::Session;

    async fn connect(&self) -> Result<Self::Session, BrokerError> {
        (**self).connect().await
    }
}
