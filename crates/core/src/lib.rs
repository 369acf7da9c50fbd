//! `streamer-core`: payload building blocks.
//!
//! This crate contains the **pure** pieces of the pipeline (no broker, no store,
//! no async): identifiers, the storage record extracted from a message body and
//! the errors raised while extracting it.

pub mod error;
pub mod id;
pub mod record;

pub use error::{EnvelopeError, EnvelopeResult};
pub use id::{CallId, WorkerId};
pub use record::CallStart;
