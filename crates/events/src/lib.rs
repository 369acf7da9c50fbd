//! Queue envelopes and the broker abstraction.
//!
//! - [`Envelope`]: the unit of work pulled from (and re-published to) a queue
//! - [`Broker`] / [`BrokerSession`]: transport-agnostic queue mechanics
//! - [`InMemoryBroker`]: a broker for tests and local runs
//! - [`DeadLetter`]: terminal record for envelopes the pipeline gives up on

pub mod broker;
pub mod dead_letter;
pub mod envelope;
pub mod in_memory_broker;

pub use broker::{
    Acknowledger, Broker, BrokerError, BrokerSession, Delivery, DeliveryStream, DeliveryTag,
};
pub use dead_letter::{DeadLetter, DeadLetterReason};
pub use envelope::Envelope;
pub use in_memory_broker::{InMemoryBroker, InMemorySession};
