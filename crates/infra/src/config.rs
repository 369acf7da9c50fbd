//! Configuration loading and representation.
//!
//! Keys are spelled exactly like the environment variables that override them
//! (`QUEUE_NAME`, `MAX_RETRY_COUNT`, ...). Resolution order, later wins:
//!
//! 1. built-in defaults
//! 2. environment variables (coerced to the type of the default they replace)
//! 3. a caller-supplied JSON object, deep-merged over the result
//!
//! The resolved [`StreamerConfig`] is handed to each pipeline once at
//! construction and never re-read.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use streamer_observability::LogFormat;

/// Environment variable names accepted in place of a canonical key.
const ENV_ALIASES: &[(&str, &str)] = &[("NUM_OF_WORKER", "NUM_WORKERS")];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct StreamerConfig {
    /// Primary queue carrying call events.
    pub queue_name: String,
    /// Persistent retry queue.
    pub retry_queue_name: String,
    /// Terminal queue for envelopes that exhausted every retry policy.
    pub dead_letter_queue_name: String,
    pub rabbitmq_url: String,
    pub mongodb_url: String,
    pub database_name: String,
    pub collection_name: String,
    /// Connection pool size of each worker's store client.
    pub max_pool_size: u32,
    /// Unacknowledged deliveries allowed in flight per subscription.
    pub prefetch_count: u16,
    /// In-process storage re-attempts before escalating to the retry queue.
    pub max_retry_count: u32,
    /// Cooldown between dequeuing from the retry queue and re-attempting.
    pub retry_timeout_ms: u64,
    pub max_connection_retry_count: u32,
    pub initial_retry_delay_ms: u64,
    /// Cap on a single connection backoff delay.
    pub max_retry_delay_ms: u64,
    /// Trips through the retry queue before dead-lettering; `0` means unbounded.
    pub max_escalation_count: u32,
    pub num_workers: usize,
    pub log_format: LogFormat,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            queue_name: "gradient_call_log".to_string(),
            retry_queue_name: "streamer_retry".to_string(),
            dead_letter_queue_name: "streamer_dead_letter".to_string(),
            rabbitmq_url: "amqp://localhost".to_string(),
            mongodb_url: "mongodb://localhost:27017".to_string(),
            database_name: "record".to_string(),
            collection_name: "event".to_string(),
            max_pool_size: 5,
            prefetch_count: 100,
            max_retry_count: 3,
            retry_timeout_ms: 5_000,
            max_connection_retry_count: 5,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            max_escalation_count: 5,
            num_workers: 4,
            log_format: LogFormat::Json,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse JSON config '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("configuration overrides must be a JSON object")]
    NotAnObject,

    #[error("invalid value '{value}' for '{key}', expected type {expected}")]
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },

    #[error("failed to deserialize config: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl StreamerConfig {
    /// Resolve defaults + process environment + optional caller overrides.
    pub fn load(overrides: Option<&Value>) -> Result<Self, ConfigError> {
        Self::resolve(std::env::vars(), overrides)
    }

    /// Like [`StreamerConfig::load`], reading the overrides from a JSON file.
    pub fn load_with_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path_str.clone(),
            source,
        })?;
        let overrides: Value = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })?;
        Self::load(Some(&overrides))
    }

    /// Resolve against an explicit environment.
    pub fn resolve<I>(env: I, overrides: Option<&Value>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = serde_json::to_value(Self::default()).map_err(ConfigError::Deserialize)?;
        let env: HashMap<String, String> = env.into_iter().collect();

        apply_env(&mut root, &env)?;

        if let Some(overrides) = overrides {
            if !overrides.is_object() {
                return Err(ConfigError::NotAnObject);
            }
            deep_merge(&mut root, overrides);
        }

        let config: Self = serde_json::from_value(root).map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let queues = [
            ("QUEUE_NAME", &self.queue_name),
            ("RETRY_QUEUE_NAME", &self.retry_queue_name),
            ("DEAD_LETTER_QUEUE_NAME", &self.dead_letter_queue_name),
        ];
        for (key, name) in &queues {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{key} cannot be empty")));
            }
        }
        for (i, (key_a, a)) in queues.iter().enumerate() {
            for (key_b, b) in &queues[i + 1..] {
                if a == b {
                    return Err(ConfigError::Invalid(format!(
                        "{key_a} and {key_b} must differ (both '{a}')"
                    )));
                }
            }
        }
        if self.prefetch_count == 0 {
            return Err(ConfigError::Invalid("PREFETCH_COUNT must be > 0".to_string()));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("NUM_WORKERS must be > 0".to_string()));
        }
        if self.max_pool_size == 0 {
            return Err(ConfigError::Invalid("MAX_POOL_SIZE must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Escalation cap, `None` when unbounded.
    pub fn escalation_limit(&self) -> Option<u32> {
        (self.max_escalation_count > 0).then_some(self.max_escalation_count)
    }
}

fn apply_env(root: &mut Value, env: &HashMap<String, String>) -> Result<(), ConfigError> {
    let Value::Object(fields) = root else {
        return Err(ConfigError::NotAnObject);
    };

    for (key, current) in fields.iter_mut() {
        let raw = env.get(key.as_str()).or_else(|| {
            ENV_ALIASES
                .iter()
                .find(|(_, canonical)| *canonical == key.as_str())
                .and_then(|(alias, _)| env.get(*alias))
        });

        if let Some(raw) = raw {
            *current = coerce(key, current, raw)?;
        }
    }

    Ok(())
}

/// Parse an environment string into the JSON type of the value it replaces.
fn coerce(key: &str, current: &Value, raw: &str) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key.to_string(),
        expected,
        value: raw.to_string(),
    };

    match current {
        Value::String(_) => Ok(Value::String(raw.to_string())),
        Value::Number(_) => raw
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| invalid("unsigned integer")),
        Value::Bool(_) => raw
            .trim()
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|_| invalid("boolean")),
        _ => Err(invalid("scalar")),
    }
}

/// Merge `overlay` into `base`; objects merge key by key, anything else is replaced.
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => merge_maps(base, overlay),
        (base, overlay) => *base = overlay.clone(),
    }
}

fn merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match base.get_mut(key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_resolve_without_input() {
        let config = StreamerConfig::resolve(Vec::new(), None).unwrap();

        assert_eq!(config, StreamerConfig::default());
        assert_eq!(config.prefetch_count, 100);
        assert_eq!(config.retry_timeout(), Duration::from_secs(5));
        assert_eq!(config.escalation_limit(), Some(5));
    }

    #[test]
    fn environment_overrides_defaults_with_type_coercion() {
        let config = StreamerConfig::resolve(
            env(&[
                ("QUEUE_NAME", "calls"),
                ("MAX_RETRY_COUNT", "7"),
                ("LOG_FORMAT", "pretty"),
                ("UNRELATED", "ignored"),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(config.queue_name, "calls");
        assert_eq!(config.max_retry_count, 7);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn log_format_is_case_insensitive_and_accepts_text() {
        let config = StreamerConfig::resolve(env(&[("LOG_FORMAT", "JSON")]), None).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);

        let config = StreamerConfig::resolve(env(&[("LOG_FORMAT", "text")]), None).unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);

        let overrides = json!({"LOG_FORMAT": "Pretty"});
        let config = StreamerConfig::resolve(Vec::new(), Some(&overrides)).unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);

        let err = StreamerConfig::resolve(env(&[("LOG_FORMAT", "xml")]), None).unwrap_err();
        assert!(matches!(err, ConfigError::Deserialize(_)));
    }

    #[test]
    fn legacy_worker_alias_is_honoured() {
        let config = StreamerConfig::resolve(env(&[("NUM_OF_WORKER", "2")]), None).unwrap();
        assert_eq!(config.num_workers, 2);

        let config = StreamerConfig::resolve(
            env(&[("NUM_OF_WORKER", "2"), ("NUM_WORKERS", "6")]),
            None,
        )
        .unwrap();
        assert_eq!(config.num_workers, 6);
    }

    #[test]
    fn caller_overrides_win_over_environment() {
        let overrides = json!({"QUEUE_NAME": "streamer_queue", "DATABASE_NAME": "streamer_database"});
        let config = StreamerConfig::resolve(
            env(&[("QUEUE_NAME", "from_env"), ("RETRY_TIMEOUT_MS", "10")]),
            Some(&overrides),
        )
        .unwrap();

        assert_eq!(config.queue_name, "streamer_queue");
        assert_eq!(config.database_name, "streamer_database");
        assert_eq!(config.retry_timeout_ms, 10);
    }

    #[test]
    fn non_numeric_environment_value_is_rejected() {
        let err = StreamerConfig::resolve(env(&[("MAX_RETRY_COUNT", "three")]), None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValueForType { ref key, .. } if key == "MAX_RETRY_COUNT"
        ));
    }

    #[test]
    fn unknown_override_keys_are_rejected() {
        let overrides = json!({"QUEUE_NAM": "typo"});
        let err = StreamerConfig::resolve(Vec::new(), Some(&overrides)).unwrap_err();
        assert!(matches!(err, ConfigError::Deserialize(_)));

        let err = StreamerConfig::resolve(Vec::new(), Some(&json!([1]))).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnObject));
    }

    #[test]
    fn queue_names_must_be_distinct() {
        let overrides = json!({"RETRY_QUEUE_NAME": "gradient_call_log"});
        let err = StreamerConfig::resolve(Vec::new(), Some(&overrides)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_escalation_count_means_unbounded() {
        let config =
            StreamerConfig::resolve(env(&[("MAX_ESCALATION_COUNT", "0")]), None).unwrap();
        assert_eq!(config.escalation_limit(), None);
    }

    #[test]
    fn deep_merge_recurses_into_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        deep_merge(&mut base, &json!({"a": {"y": 3}, "c": true}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3}, "b": 1, "c": true}));
    }

    #[test]
    fn load_with_file_reads_json_overrides() {
        let path = std::env::temp_dir().join(format!("streamer-config-{}.json", uuid::Uuid::now_v7()));
        fs::write(&path, r#"{"NUM_WORKERS": 1, "COLLECTION_NAME": "calls"}"#).unwrap();

        let config = StreamerConfig::load_with_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(config.num_workers, 1);
        assert_eq!(config.collection_name, "calls");
    }
}
