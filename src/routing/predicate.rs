//! JSON predicate evaluation (spec §4.5, §6): `{ type, field, value }`
//! matched against a message's `metadata` then its JSON payload.
//!
//! Grounded on the teacher's radix-tree topic matcher
//! (`brokers/pub-sub/radix_tree.rs`) for the general shape of "resolve a
//! dotted path against structured data, fail closed on anything
//! unresolved" — the predicate language itself (eq/neq/gt/gte/lt/lte/
//! contains) has no teacher analogue and is built directly from the
//! spec's operator table.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, PredicateValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    #[serde(rename = "type")]
    pub op: Operator,
    pub field: String,
    pub value: PredicateValue,
}

impl Predicate {
    pub fn new(op: Operator, field: impl Into<String>, value: PredicateValue) -> Self {
        Self {
            op,
            field: field.into(),
            value,
        }
    }

    /// An unresolvable field yields `false`, never an error (spec §4.5).
    pub fn evaluate(&self, message: &Message) -> bool {
        let Some(actual) = resolve_field(message, &self.field) else {
            return false;
        };

        match self.op {
            Operator::Eq => eq_coerced(&actual, &self.value),
            Operator::Neq => !eq_coerced(&actual, &self.value),
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let actual_pv = PredicateValue::from(actual);
                let (Some(a), Some(b)) = (actual_pv.as_f64(), self.value.as_f64()) else {
                    return false;
                };
                match self.op {
                    Operator::Gt => a > b,
                    Operator::Gte => a >= b,
                    Operator::Lt => a < b,
                    Operator::Lte => a <= b,
                    _ => unreachable!(),
                }
            }
            Operator::Contains => contains(&actual, &self.value),
        }
    }
}

fn resolve_in(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value.clone();
    for segment in path {
        current = current.get(*segment)?.clone();
    }
    Some(current)
}

/// Dotted field path, resolved against `metadata` first, then the JSON
/// payload (spec §4.5).
fn resolve_field(message: &Message, field: &str) -> Option<Value> {
    let segments: Vec<&str> = field.split('.').collect();
    let (head, rest) = segments.split_first()?;

    if let Some(root) = message.metadata.get(*head) {
        if rest.is_empty() {
            return Some(root.clone());
        }
        if let Some(found) = resolve_in(root, rest) {
            return Some(found);
        }
    }

    message.payload_as_json().and_then(|payload| resolve_in(&payload, &segments))
}

fn eq_coerced(actual: &Value, expected: &PredicateValue) -> bool {
    let actual_pv = PredicateValue::from(actual.clone());
    if std::mem::discriminant(&actual_pv) == std::mem::discriminant(expected) {
        return actual_pv == *expected;
    }
    actual_pv.stringify() == expected.stringify()
}

fn contains(actual: &Value, needle: &PredicateValue) -> bool {
    match actual {
        Value::String(s) => s.contains(&needle.stringify()),
        Value::Array(items) => items.iter().any(|item| PredicateValue::from(item.clone()) == *needle),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn msg_with_metadata(pairs: &[(&str, Value)]) -> Message {
        let mut metadata = HashMap::new();
        for (k, v) in pairs {
            metadata.insert(k.to_string(), v.clone());
        }
        Message::new("t", Bytes::from_static(b"{}")).with_metadata(metadata)
    }

    #[test]
    fn eq_matches_scenario_s5() {
        // Scenario S5
        let predicate = Predicate::new(Operator::Eq, "priority", PredicateValue::String("high".into()));
        let high = msg_with_metadata(&[("priority", Value::String("high".into()))]);
        let low = msg_with_metadata(&[("priority", Value::String("low".into()))]);
        assert!(predicate.evaluate(&high));
        assert!(!predicate.evaluate(&low));
    }

    #[test]
    fn unresolvable_field_is_false_not_error() {
        let predicate = Predicate::new(Operator::Eq, "missing.path", PredicateValue::String("x".into()));
        let msg = msg_with_metadata(&[]);
        assert!(!predicate.evaluate(&msg));
    }

    #[test]
    fn numeric_operators_coerce_both_sides() {
        let predicate = Predicate::new(Operator::Gte, "count", PredicateValue::String("3".into()));
        let msg = msg_with_metadata(&[("count", Value::from(5))]);
        assert!(predicate.evaluate(&msg));
    }

    #[test]
    fn contains_checks_array_membership() {
        let predicate = Predicate::new(Operator::Contains, "tags", PredicateValue::String("urgent".into()));
        let msg = msg_with_metadata(&[("tags", Value::Array(vec![Value::String("urgent".into())]))]);
        assert!(predicate.evaluate(&msg));
    }

    #[test]
    fn dotted_path_resolves_nested_metadata() {
        let predicate = Predicate::new(Operator::Eq, "user.id", PredicateValue::Number(42.0));
        let nested = serde_json::json!({"id": 42});
        let msg = msg_with_metadata(&[("user", nested)]);
        assert!(predicate.evaluate(&msg));
    }

    #[test]
    fn falls_back_to_json_payload_for_content_type_json() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let msg = Message::new("t", Bytes::from(r#"{"priority":"high"}"#)).with_headers(headers);
        let predicate = Predicate::new(Operator::Eq, "priority", PredicateValue::String("high".into()));
        assert!(predicate.evaluate(&msg));
    }
}
