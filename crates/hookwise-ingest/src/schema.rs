//! Structural validation of webhook payloads.
//!
//! Schemas are written in a subset of JSON Schema: `type` (a name or a list
//! of names), `required`, `properties`, `items` and `enum`. Other keywords
//! are accepted and ignored. Validation collects every violation instead of
//! stopping at the first, so a rejection tells the sender everything that is
//! wrong with the payload.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

/// Schema registration failures.
#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    /// Schema document is not a valid schema.
    #[error("invalid schema for {event_type}: {message}")]
    Invalid {
        /// Event type being registered
        event_type: String,
        /// Parse failure description
        message: String,
    },

    /// Schema file could not be read.
    #[error("failed to read schema file {path}: {message}")]
    Io {
        /// File path
        path: String,
        /// I/O failure description
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JsonType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
    Null,
}

impl JsonType {
    fn admits(self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }

    fn name_of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_f64() => "number",
            Value::Number(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Null => "null",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TypeSet {
    One(JsonType),
    Many(Vec<JsonType>),
}

impl TypeSet {
    fn admits(&self, value: &Value) -> bool {
        match self {
            Self::One(t) => t.admits(value),
            Self::Many(ts) => ts.iter().any(|t| t.admits(value)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::One(t) => t.to_string(),
            Self::Many(ts) => ts.iter().map(ToString::to_string).collect::<Vec<_>>().join(" or "),
        }
    }
}

/// Compiled payload schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadSchema {
    #[serde(default, rename = "type")]
    kind: Option<TypeSet>,
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, PayloadSchema>,
    #[serde(default)]
    items: Option<Box<PayloadSchema>>,
    #[serde(default, rename = "enum")]
    allowed: Option<Vec<Value>>,
}

impl PayloadSchema {
    /// Parses a schema document.
    ///
    /// # Errors
    ///
    /// Returns the parse failure if the document is not a valid schema.
    pub fn from_slice(schema: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(schema)
    }

    /// Returns every violated constraint as `path: message`.
    pub fn violations(&self, value: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        self.check(value, "/", &mut violations);
        violations
    }

    fn check(&self, value: &Value, path: &str, violations: &mut Vec<String>) {
        if let Some(kind) = &self.kind {
            if !kind.admits(value) {
                violations.push(format!(
                    "{path}: expected {}, found {}",
                    kind.describe(),
                    JsonType::name_of(value)
                ));
                return;
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                violations.push(format!("{path}: value {value} is not one of the allowed values"));
            }
        }

        match value {
            Value::Object(fields) => {
                for name in &self.required {
                    if !fields.contains_key(name) {
                        violations.push(format!("{path}: missing required property '{name}'"));
                    }
                }
                for (name, schema) in &self.properties {
                    if let Some(field) = fields.get(name) {
                        schema.check(field, &child_path(path, name), violations);
                    }
                }
            },
            Value::Array(elements) => {
                if let Some(items) = &self.items {
                    for (index, element) in elements.iter().enumerate() {
                        items.check(element, &child_path(path, &index.to_string()), violations);
                    }
                }
            },
            _ => {},
        }
    }
}

fn child_path(parent: &str, segment: &str) -> String {
    if parent == "/" {
        format!("/{segment}")
    } else {
        format!("{parent}/{segment}")
    }
}

const DEFAULT_SCHEMAS: &[(&str, &str)] = &[
    ("push", include_str!("../schemas/push.json")),
    ("pull_request", include_str!("../schemas/pull_request.json")),
    ("issues", include_str!("../schemas/issues.json")),
    ("release", include_str!("../schemas/release.json")),
];

/// Schemas keyed by event type.
///
/// Event types without a schema pass validation unchecked.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, PayloadSchema>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in schemas for `push`,
    /// `pull_request`, `issues` and `release`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (event_type, schema) in DEFAULT_SCHEMAS {
            match PayloadSchema::from_slice(schema.as_bytes()) {
                Ok(parsed) => {
                    registry.schemas.insert((*event_type).to_string(), parsed);
                },
                Err(e) => {
                    debug_assert!(false, "built-in {event_type} schema does not parse: {e}");
                    error!(
                        event_type = %event_type,
                        error = %e,
                        "built-in schema does not parse, payloads of this type go unchecked"
                    );
                },
            }
        }
        registry
    }

    /// Registers or replaces the schema for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError::Invalid` if the document does not parse.
    pub fn register(&mut self, event_type: &str, schema: &[u8]) -> Result<(), SchemaError> {
        let parsed = PayloadSchema::from_slice(schema).map_err(|e| SchemaError::Invalid {
            event_type: event_type.to_string(),
            message: e.to_string(),
        })?;
        self.schemas.insert(event_type.to_string(), parsed);
        Ok(())
    }

    /// Registers the schema stored at `path` for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError::Io` if the file cannot be read and
    /// `SchemaError::Invalid` if it does not parse.
    pub fn register_file(&mut self, event_type: &str, path: &Path) -> Result<(), SchemaError> {
        let schema = std::fs::read(path).map_err(|e| SchemaError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.register(event_type, &schema)
    }

    /// Returns true if a schema is registered for `event_type`.
    pub fn contains(&self, event_type: &str) -> bool {
        self.schemas.contains_key(event_type)
    }

    /// Returns the registered event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.schemas.keys().cloned().collect();
        types.sort();
        types
    }

    /// Validates a raw payload against the schema for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns the violated constraints. Unregistered event types always
    /// pass.
    pub fn validate(&self, event_type: &str, payload: &[u8]) -> Result<(), Vec<String>> {
        let Some(schema) = self.schemas.get(event_type) else {
            return Ok(());
        };

        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| vec![format!("/: payload is not valid JSON: {e}")])?;

        let violations = schema.violations(&value);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
