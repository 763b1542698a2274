//! The immutable `Message` record (spec §3) and the tagged predicate value
//! type routing uses to carry untyped JSON literals (Design Notes §9).

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::time::current_time_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: u64,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            headers: HashMap::new(),
            metadata: HashMap::new(),
            timestamp: current_time_ms(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get("Content-Type")
            .or_else(|| self.headers.get("content-type"))
            .map(|s| s.as_str())
    }

    /// Parses `payload` as JSON iff the message declares a JSON content
    /// type; used by the routing engine to resolve predicate field paths
    /// against the body (spec §4.5).
    pub fn payload_as_json(&self) -> Option<Value> {
        if self.content_type()? != "application/json" {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Untyped predicate literal, carried as a tagged variant rather than
/// reflected from a host type (Design Notes §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredicateValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    Raw(Value),
}

impl From<Value> for PredicateValue {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => PredicateValue::String(s),
            Value::Number(n) => n.as_f64().map(PredicateValue::Number).unwrap_or(PredicateValue::Raw(Value::Number(n))),
            Value::Bool(b) => PredicateValue::Bool(b),
            Value::Null => PredicateValue::Null,
            other => PredicateValue::Raw(other),
        }
    }
}

impl PredicateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PredicateValue::Number(n) => Some(*n),
            PredicateValue::String(s) => s.parse().ok(),
            PredicateValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            PredicateValue::String(s) => Value::String(s),
            PredicateValue::Number(n) => serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            PredicateValue::Bool(b) => Value::Bool(b),
            PredicateValue::Null => Value::Null,
            PredicateValue::Raw(v) => v,
        }
    }

    pub fn stringify(&self) -> String {
        match self {
            PredicateValue::String(s) => s.clone(),
            PredicateValue::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            PredicateValue::Bool(b) => b.to_string(),
            PredicateValue::Null => "null".to_string(),
            PredicateValue::Raw(v) => v.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payload_requires_content_type() {
        let msg = Message::new("t", Bytes::from(r#"{"a":1}"#));
        assert!(msg.payload_as_json().is_none());

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let msg = Message::new("t", Bytes::from(r#"{"a":1}"#)).with_headers(headers);
        assert_eq!(msg.payload_as_json().unwrap()["a"], 1);
    }

    #[test]
    fn predicate_value_stringify() {
        assert_eq!(PredicateValue::Number(3.0).stringify(), "3");
        assert_eq!(PredicateValue::Number(3.5).stringify(), "3.5");
        assert_eq!(PredicateValue::Bool(true).stringify(), "true");
    }
}
