//! Domain schema validation (spec §4.6): structural field checks plus an
//! optional custom validator run afterwards.
//!
//! Grounded on the teacher's config-validation style (plain functions
//! returning `Result<_, String>` checked before an operation proceeds,
//! e.g. `brokers/queues/queue.rs` config checks) — schemas have no direct
//! teacher analogue since the teacher's queues are untyped byte streams.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct Schema {
    pub fields: HashMap<String, FieldType>,
    pub validator: Option<Validator>,
}

impl Schema {
    pub fn new(fields: HashMap<String, FieldType>) -> Self {
        Self { fields, validator: None }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Verifies presence and JSON-type match for every declared field,
    /// then runs the custom validator if one is set. Fails on the first
    /// structural mismatch.
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        for (name, field_type) in &self.fields {
            let Some(value) = payload.get(name) else {
                return Err(format!("missing required field '{name}'"));
            };
            if !field_type.matches(value) {
                return Err(format!("field '{name}' does not match declared type {field_type:?}"));
            }
        }
        if let Some(validator) = &self.validator {
            validator(payload)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        write!(f, "{s}")
    }
}
