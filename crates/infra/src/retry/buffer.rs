use std::collections::VecDeque;

use streamer_events::Envelope;

/// Envelopes awaiting another storage attempt, oldest first.
///
/// Owned by exactly one drain task; never persisted.
#[derive(Debug, Default)]
pub struct RetryBuffer {
    pending: VecDeque<Envelope>,
}

impl RetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the end.
    pub fn push(&mut self, envelope: Envelope) {
        self.pending.push_back(envelope);
    }

    /// Take the oldest envelope.
    pub fn pop(&mut self) -> Option<Envelope> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pops_in_insertion_order() {
        let mut buffer = RetryBuffer::new();
        buffer.push(Envelope::new(json!({"n": 1})));
        buffer.push(Envelope::new(json!({"n": 2})));
        buffer.push(Envelope::new(json!({"n": 1})).with_retry_count(1));

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.pop().unwrap().body()["n"], 1);
        assert_eq!(buffer.pop().unwrap().body()["n"], 2);
        assert_eq!(buffer.pop().unwrap().retry_count(), 1);
        assert!(buffer.pop().is_none());
        assert!(buffer.is_empty());
    }
}
