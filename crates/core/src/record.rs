//! The storage record carried inside an envelope body.

use serde_json::{Map, Value};

use crate::error::{EnvelopeError, EnvelopeResult};
use crate::id::CallId;

/// Field of the envelope body holding the record to persist.
pub const CALL_START_FIELD: &str = "call_start";

/// Identity field inside the `call_start` record.
pub const CALL_ID_FIELD: &str = "call_id";

/// A `call_start` record, written verbatim into the document store.
///
/// The document is kept as raw JSON: the pipeline does not validate its schema
/// beyond requiring a usable `call_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStart {
    call_id: CallId,
    document: Map<String, Value>,
}

impl CallStart {
    /// Extract the record from an envelope body (`{"call_start": {...}}`).
    pub fn from_body(body: &Value) -> EnvelopeResult<Self> {
        let body = body
            .as_object()
            .ok_or_else(|| EnvelopeError::invalid_field("body", "expected a JSON object"))?;

        let record = body
            .get(CALL_START_FIELD)
            .ok_or(EnvelopeError::MissingField("body.call_start"))?;

        Self::from_document(record.clone())
    }

    /// Build a record from the `call_start` object itself.
    pub fn from_document(value: Value) -> EnvelopeResult<Self> {
        let Value::Object(document) = value else {
            return Err(EnvelopeError::invalid_field(
                "call_start",
                "expected a JSON object",
            ));
        };

        let call_id = document
            .get(CALL_ID_FIELD)
            .ok_or(EnvelopeError::MissingField("call_start.call_id"))
            .and_then(CallId::from_value)?;

        Ok(Self { call_id, document })
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_call_start_verbatim() {
        let body = json!({
            "call_start": {"call_id": "c-1", "caller": "+100", "nested": {"a": [1, 2]}},
            "other": true
        });

        let record = CallStart::from_body(&body).unwrap();
        assert_eq!(record.call_id().as_str(), "c-1");
        assert_eq!(
            Value::Object(record.document().clone()),
            json!({"call_id": "c-1", "caller": "+100", "nested": {"a": [1, 2]}})
        );
    }

    #[test]
    fn missing_call_start_is_a_parse_fault() {
        let err = CallStart::from_body(&json!({"call_end": {}})).unwrap_err();
        assert_eq!(err, EnvelopeError::MissingField("body.call_start"));
    }

    #[test]
    fn missing_call_id_is_a_parse_fault() {
        let err = CallStart::from_body(&json!({"call_start": {"caller": "x"}})).unwrap_err();
        assert_eq!(err, EnvelopeError::MissingField("call_start.call_id"));
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(CallStart::from_body(&json!("call_start")).is_err());
        assert!(CallStart::from_body(&json!({"call_start": [1]})).is_err());
    }
}
