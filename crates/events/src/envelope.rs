use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use streamer_core::{CallStart, EnvelopeError, EnvelopeResult};

/// Envelope for a queued call event.
///
/// This is the unit pulled from either queue and the unit re-published to the
/// retry queue.
///
/// Notes:
/// - `retry_count` is only ever advanced by the retry coordinator.
/// - Envelopes are never mutated in place: a retry or an escalation produces a
///   new value (see [`Envelope::next_retry`] and [`Envelope::escalated`]).
/// - Top-level fields this crate does not know about travel along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    body: Value,

    #[serde(rename = "retryCount", default)]
    retry_count: u32,

    /// Number of trips through the persistent retry queue after exhausting
    /// in-process retries.
    #[serde(
        rename = "escalationCount",
        default,
        skip_serializing_if = "is_zero"
    )]
    escalation_count: u32,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Envelope {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            retry_count: 0,
            escalation_count: 0,
            extra: Map::new(),
        }
    }

    /// Decode an envelope from raw message bytes.
    pub fn decode(payload: &[u8]) -> EnvelopeResult<Self> {
        serde_json::from_slice(payload).map_err(|e| EnvelopeError::malformed(e.to_string()))
    }

    /// Encode the envelope for publication.
    pub fn encode(&self) -> EnvelopeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::malformed(e.to_string()))
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn escalation_count(&self) -> u32 {
        self.escalation_count
    }

    /// Extract the record to persist.
    pub fn call_start(&self) -> EnvelopeResult<CallStart> {
        CallStart::from_body(&self.body)
    }

    /// A copy of this envelope carrying `retry_count + 1`.
    pub fn next_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// A copy of this envelope marked as having gone back to the retry queue
    /// once more. `retry_count` is kept as-is.
    pub fn escalated(&self) -> Self {
        Self {
            escalation_count: self.escalation_count.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}
