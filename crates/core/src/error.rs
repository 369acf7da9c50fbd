//! Payload error model.

use thiserror::Error;

/// Result type used when decoding message payloads.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// A message payload could not be turned into something storable.
///
/// These are parse faults: deterministic for a given payload, but still routed
/// through the retry path rather than discarded at the consumer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The raw bytes are not a JSON envelope.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A required field is absent (e.g. `body.call_start`).
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// An identifier was empty or not representable.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl EnvelopeError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
