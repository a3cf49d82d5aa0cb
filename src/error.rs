//! Caller-visible error taxonomy for the trigger and event core.

use serde::Serialize;
use thiserror::Error;

/// One payload field that did not match the trigger's API schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMismatch {
    pub field: String,
    /// Expected type tag, or None when the field is not part of the schema.
    pub expected: Option<String>,
    /// What was supplied: a JSON type name, or "missing".
    pub found: String,
}

impl std::fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.expected {
            Some(expected) => write!(f, "{} (expected {}, got {})", self.field, expected, self.found),
            None => write!(f, "{} (unexpected field)", self.field),
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerdError {
    #[error("Invalid trigger definition: {0}")]
    Validation(String),

    #[error("Payload does not match schema: {}", format_fields(.fields))]
    SchemaValidation { fields: Vec<FieldMismatch> },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Event references unknown trigger {trigger_id}")]
    ForeignKey { trigger_id: i64 },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl TriggerdError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TriggerdError::Validation(msg.into())
    }

    pub fn trigger_not_found(id: i64) -> Self {
        TriggerdError::NotFound {
            kind: "Trigger",
            id,
        }
    }

    pub fn event_not_found(id: i64) -> Self {
        TriggerdError::NotFound { kind: "Event", id }
    }

    /// Only storage failures are worth retrying; everything else means the request was wrong.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TriggerdError::Storage(_))
    }
}

fn format_fields(fields: &[FieldMismatch]) -> String {
    fields
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, TriggerdError>;
