//! Broker adapters.

pub mod amqp;

pub use amqp::{AmqpBroker, AmqpSession};
