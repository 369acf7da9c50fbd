//! Strongly-typed identifiers used across the pipeline.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;

/// Stable identity of a call record (`call_start.call_id`).
///
/// Producers emit it either as a JSON string or a JSON number; both are
/// normalised to their string form so logging and equality do not depend on
/// the producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read an identifier out of a JSON value.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Number(n) => Ok(Self(n.to_string())),
            other => Err(EnvelopeError::invalid_id(format!(
                "call_id must be a string or number, got {other}"
            ))),
        }
    }
}

impl core::fmt::Display for CallId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CallId {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(EnvelopeError::invalid_id("call_id is empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Index of a pipeline instance spawned by the worker replicator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_id_accepts_strings_and_numbers() {
        assert_eq!(CallId::from_value(&json!("abc-1")).unwrap().as_str(), "abc-1");
        assert_eq!(CallId::from_value(&json!(42)).unwrap().as_str(), "42");
    }

    #[test]
    fn call_id_rejects_blank_and_structured_values() {
        assert!(CallId::from_value(&json!("   ")).is_err());
        assert!(CallId::from_value(&json!({"id": 1})).is_err());
        assert!(CallId::from_value(&Value::Null).is_err());
    }

    #[test]
    fn worker_id_display() {
        assert_eq!(WorkerId::new(3).to_string(), "worker-3");
    }
}
