//! Terminal records for envelopes the pipeline gives up on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Why an envelope left the retry cycle for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The envelope went through the retry queue `MAX_ESCALATION_COUNT` times.
    EscalationsExhausted,
    /// The retry queue held bytes that are not an envelope at all.
    Undecodable,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::EscalationsExhausted => "escalations_exhausted",
            DeadLetterReason::Undecodable => "undecodable",
        }
    }
}

/// A record published to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub failed_at: DateTime<Utc>,
    pub reason: DeadLetterReason,
    /// Last error seen before giving up.
    pub error: String,
    /// Queue the envelope was taken from.
    pub source_queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    /// Lossy UTF-8 rendering of payloads that could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl DeadLetter {
    pub fn exhausted(envelope: Envelope, source_queue: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            failed_at: Utc::now(),
            reason: DeadLetterReason::EscalationsExhausted,
            error: error.into(),
            source_queue: source_queue.into(),
            envelope: Some(envelope),
            raw: None,
        }
    }

    pub fn undecodable(payload: &[u8], source_queue: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            failed_at: Utc::now(),
            reason: DeadLetterReason::Undecodable,
            error: error.into(),
            source_queue: source_queue.into(),
            envelope: None,
            raw: Some(String::from_utf8_lossy(payload).into_owned()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exhausted_record_embeds_envelope() {
        let env = Envelope::new(json!({"call_start": {"call_id": "x"}})).with_retry_count(3);
        let dl = DeadLetter::exhausted(env.clone(), "streamer_retry", "insert failed");

        let value: serde_json::Value = serde_json::from_slice(&dl.encode().unwrap()).unwrap();
        assert_eq!(value["reason"], json!("escalations_exhausted"));
        assert_eq!(value["sourceQueue"], json!("streamer_retry"));
        assert_eq!(value["envelope"]["retryCount"], json!(3));
        assert!(value.get("raw").is_none());
    }

    #[test]
    fn undecodable_record_keeps_raw_text() {
        let dl = DeadLetter::undecodable(b"{oops", "streamer_retry", "expected value");

        assert_eq!(dl.reason.as_str(), "undecodable");
        assert_eq!(dl.raw.as_deref(), Some("{oops"));
        assert!(dl.envelope.is_none());
    }
}
