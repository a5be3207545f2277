//! Raw kiosk events as they arrive on the bus.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur while decoding a message payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Message has no payload")]
    EmptyPayload,

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// A decoded, not yet validated, kiosk event.
///
/// Keeps the JSON object untouched so that the validator can tell a missing
/// key apart from an explicit `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    fields: Map<String, Value>,
}

impl RawEvent {
    pub const AT: &'static str = "at";
    pub const SITE: &'static str = "site";
    pub const VAL: &'static str = "val";
    pub const TYPE: &'static str = "type";

    /// Decode a bus payload
    pub fn decode(payload: Option<&[u8]>) -> Result<Self, DecodeError> {
        let payload = payload.ok_or(DecodeError::EmptyPayload)?;

        match serde_json::from_slice(payload)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(DecodeError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// The first key holding an explicit `null`, if any
    pub fn first_null_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, value)| value.is_null())
            .map(|(key, _)| key.as_str())
    }

    /// Read a field as an integer.
    ///
    /// Accepts JSON integers, whole-valued floats and numeric strings.
    pub fn integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(integer_like)
    }
}

impl From<Map<String, Value>> for RawEvent {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl std::fmt::Display for RawEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.fields.clone()))
    }
}

fn integer_like(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
