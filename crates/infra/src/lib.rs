//! Infrastructure layer: configuration, broker and store adapters, and the
//! call-event pipeline built on them.

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod stats;
pub mod store;
pub mod workers;


pub use config::{ConfigError, StreamerConfig};
pub use pipeline::{Pipeline, PipelineError};
pub use stats::{PipelineStats, StatsSnapshot};
