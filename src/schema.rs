//! The schema-validation seam.
//!
//! Validation is an external collaborator behind the [`Validator`] trait:
//! build a schema handle from a field map, validate a value into a list of
//! messages (empty = valid), export a plain description for introspection
//! tooling. The router never looks inside a handle.
//!
//! [`FieldValidator`] is the built-in implementation, a small field-map
//! checker covering the common cases (presence, JSON type, string length).
//! Swap in anything heavier via [`Pipeline::validator`](crate::Pipeline).

use std::sync::Arc;

use serde_json::{Map, Value};

/// An opaque, immutable schema built once at registration time.
#[derive(Clone, Debug)]
pub struct SchemaHandle {
    fields: Arc<Map<String, Value>>,
}

impl SchemaHandle {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields: Arc::new(fields) }
    }

    /// The raw field map this handle was built from.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// The validator collaborator contract.
pub trait Validator: Send + Sync {
    /// Builds a schema from a field map (field name → rule object).
    fn build_object_schema(&self, fields: Map<String, Value>) -> SchemaHandle;

    /// Validates `value` against `schema`. An empty list means valid.
    fn validate(&self, schema: &SchemaHandle, value: &Value) -> Vec<String>;

    /// A plain description object for documentation tooling.
    fn export_metadata(&self, schema: &SchemaHandle) -> Value;
}

// ── Built-in field-map validator ──────────────────────────────────────────────

/// The default validator.
///
/// Rules per field: `{"type": "string" | "number" | "boolean" | "object" |
/// "array", "required": bool, "min_length": n, "max_length": n}`. Unknown
/// rule keys are ignored, so richer validators can reuse the same field
/// maps.
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldValidator;

impl Validator for FieldValidator {
    fn build_object_schema(&self, fields: Map<String, Value>) -> SchemaHandle {
        SchemaHandle::new(fields)
    }

    fn validate(&self, schema: &SchemaHandle, value: &Value) -> Vec<String> {
        let Some(object) = value.as_object() else {
            return vec!["expected an object".to_owned()];
        };

        let mut messages = Vec::new();
        for (field, rules) in schema.fields() {
            let required = rules
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let Some(actual) = object.get(field) else {
                if required {
                    messages.push(format!("{field} is required"));
                }
                continue;
            };

            if let Some(expected) = rules.get("type").and_then(Value::as_str) {
                if !type_matches(expected, actual) {
                    messages.push(format!("{field} must be a {expected}"));
                    continue;
                }
            }
            if let Some(min) = rules.get("min_length").and_then(Value::as_u64) {
                if let Some(s) = actual.as_str() {
                    if (s.chars().count() as u64) < min {
                        messages.push(format!("{field} must be at least {min} characters"));
                    }
                }
            }
            if let Some(max) = rules.get("max_length").and_then(Value::as_u64) {
                if let Some(s) = actual.as_str() {
                    if (s.chars().count() as u64) > max {
                        messages.push(format!("{field} must be at most {max} characters"));
                    }
                }
            }
        }
        messages
    }

    fn export_metadata(&self, schema: &SchemaHandle) -> Value {
        Value::Object(schema.fields().clone())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string"  => value.is_string(),
        "number"  => value.is_number(),
        "boolean" => value.is_boolean(),
        "object"  => value.is_object(),
        "array"   => value.is_array(),
        _         => true,
    }
}

/// Shorthand for building a schema with the default validator.
///
/// ```rust
/// use serde_json::json;
/// let schema = viaduct::object_schema(json!({
///     "id": { "type": "string", "min_length": 1 }
/// }));
/// ```
pub fn object_schema(fields: Value) -> SchemaHandle {
    let map = fields.as_object().cloned().unwrap_or_default();
    FieldValidator.build_object_schema(map)
}
