//! Telemetry event model
//!
//! Events are open JSON objects. Readers for the known fields apply a fixed
//! default instead of failing, so partially populated records still score.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const ACTOR_ID: &str = "actor_id";
/// Alias emitted by older collectors
pub const USER_ID: &str = "user_id";
pub const EVENT_TYPE: &str = "event_type";
pub const TIMESTAMP: &str = "timestamp";

pub const SENSITIVE_DATA_ACCESS: &str = "sensitive_data_access";
pub const UNUSUAL_TIME: &str = "unusual_time";
pub const LARGE_DATA_TRANSFER: &str = "large_data_transfer";
pub const PRIVILEGED_ACTION: &str = "privileged_action";

pub const FILE_ACCESS_COUNT: &str = "file_access_count";
pub const DATA_TRANSFER_SIZE_MB: &str = "data_transfer_size_mb";
pub const HOUR_OF_DAY: &str = "hour_of_day";

pub const RISK_SCORE: &str = "risk_score";
pub const RISK_LEVEL: &str = "risk_level";
pub const ML_ANOMALY_SCORE: &str = "ml_anomaly_score";
pub const ML_IS_ANOMALY: &str = "ml_is_anomaly";
pub const ML_REASONS: &str = "ml_reasons";
pub const COMBINED_RISK_SCORE: &str = "combined_risk_score";

pub const UNKNOWN_ACTOR: &str = "unknown";
pub const DEFAULT_HOUR: i64 = 12;

/// Errors raised while decoding or projecting events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event is not a JSON object")]
    NotAnObject,

    #[error("Event has no timestamp")]
    MissingTimestamp,

    #[error("Unrecognized timestamp: {0}")]
    InvalidTimestamp(String),
}

/// A single telemetry event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: Map<String, Value>,
}

impl Event {
    pub fn new() -> Self {
        Event { fields: Map::new() }
    }

    /// Parse one JSON-encoded event
    pub fn from_json(line: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EventError> {
        match value {
            Value::Object(fields) => Ok(Event { fields }),
            _ => Err(EventError::NotAnObject),
        }
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Builder-style setter
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Actor identifier, falling back to `user_id` and then "unknown"
    pub fn actor_id(&self) -> &str {
        self.str_field(ACTOR_ID)
            .or_else(|| self.str_field(USER_ID))
            .unwrap_or(UNKNOWN_ACTOR)
    }

    pub fn event_type(&self) -> &str {
        self.str_field(EVENT_TYPE).unwrap_or("")
    }

    /// Boolean flag; non-zero numbers count as set, anything else is unset
    pub fn flag(&self, key: &str) -> bool {
        match self.fields.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            _ => false,
        }
    }

    /// Numeric field, 0 when absent or not a number
    pub fn number(&self, key: &str) -> f64 {
        self.fields
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    pub fn file_access_count(&self) -> f64 {
        self.number(FILE_ACCESS_COUNT)
    }

    pub fn data_transfer_size_mb(&self) -> f64 {
        self.number(DATA_TRANSFER_SIZE_MB)
    }

    /// Hour of day, 12 when absent or not a whole number
    pub fn hour_of_day(&self) -> i64 {
        match self.fields.get(HOUR_OF_DAY) {
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .unwrap_or(DEFAULT_HOUR),
            None => DEFAULT_HOUR,
        }
    }

    /// Rule-based risk score previously attached by the enricher, 0 when absent
    pub fn risk_score(&self) -> f64 {
        self.number(RISK_SCORE)
    }

    /// Event instant, accepting RFC 3339, `YYYY-MM-DD HH:MM:SS` or epoch seconds
    pub fn timestamp(&self) -> Result<DateTime<Utc>, EventError> {
        match self.fields.get(TIMESTAMP) {
            None | Some(Value::Null) => Err(EventError::MissingTimestamp),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .ok_or_else(|| EventError::InvalidTimestamp(n.to_string())),
            Some(Value::String(s)) => parse_timestamp(s),
            Some(other) => Err(EventError::InvalidTimestamp(other.to_string())),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Event { fields }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EventError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(EventError::InvalidTimestamp(raw.to_string()))
}
