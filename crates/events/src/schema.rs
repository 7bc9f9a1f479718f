//! Payload validation.
//!
//! Validators are plain values registered per command/event type tag. They
//! report failures as a [`ValidationOutcome`] instead of erroring, so the bus
//! decides how a rejection surfaces.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(Vec<FieldError>),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }

    pub fn errors(&self) -> &[FieldError] {
        match self {
            ValidationOutcome::Valid => &[],
            ValidationOutcome::Invalid(errors) => errors,
        }
    }

    fn from_errors(errors: Vec<FieldError>) -> Self {
        if errors.is_empty() {
            ValidationOutcome::Valid
        } else {
            ValidationOutcome::Invalid(errors)
        }
    }
}

pub type PayloadValidator = Arc<dyn Fn(&JsonValue) -> ValidationOutcome + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl FieldKind {
    fn matches(self, value: &JsonValue) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldRule {
    name: String,
    kind: FieldKind,
    required: bool,
}

/// Declarative object schema: the payload must be a JSON object whose listed
/// fields have the declared kinds. Unlisted fields are ignored.
///
/// A `null` optional field counts as absent. Required string fields must be
/// non-empty.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    fields: Vec<FieldRule>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn validate(&self, payload: &JsonValue) -> ValidationOutcome {
        let Some(object) = payload.as_object() else {
            return ValidationOutcome::Invalid(vec![FieldError::new(
                "payload",
                "expected an object",
            )]);
        };

        let mut errors = Vec::new();
        for rule in &self.fields {
            match object.get(&rule.name) {
                None | Some(JsonValue::Null) if rule.required => {
                    errors.push(FieldError::new(&rule.name, "is required"));
                }
                None | Some(JsonValue::Null) => {}
                Some(value) if !rule.kind.matches(value) => {
                    errors.push(FieldError::new(
                        &rule.name,
                        format!("expected {}", rule.kind.name()),
                    ));
                }
                Some(JsonValue::String(s)) if rule.required && s.trim().is_empty() => {
                    errors.push(FieldError::new(&rule.name, "cannot be empty"));
                }
                Some(_) => {}
            }
        }
        ValidationOutcome::from_errors(errors)
    }

    /// Wrap into a registrable validator.
    pub fn into_validator(self) -> PayloadValidator {
        Arc::new(move |payload| self.validate(payload))
    }
}
