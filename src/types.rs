use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TriggerdError};
use crate::lifecycle::EventStatus;

/// Arbitrary key/value payload carried by an event.
pub type Payload = serde_json::Map<String, Value>;

/// Field name to expected primitive type for API trigger payloads.
pub type ApiSchema = BTreeMap<String, FieldType>;

/// A registered trigger. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
    pub created_at: DateTime<Utc>,
}

/// Exactly one of schedule / api_schema, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled { schedule: String },
    Api { api_schema: ApiSchema },
}

impl Trigger {
    /// The schedule expression, for scheduled triggers.
    pub fn schedule_expr(&self) -> Option<&str> {
        match &self.kind {
            TriggerKind::Scheduled { schedule } => Some(schedule),
            TriggerKind::Api { .. } => None,
        }
    }
}

impl TriggerKind {
    pub fn type_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled { .. } => "scheduled",
            TriggerKind::Api { .. } => "api",
        }
    }
}

/// Primitive type tags accepted in an API schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Str => "str",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "str" => Some(FieldType::Str),
            "int" => Some(FieldType::Int),
            "float" => Some(FieldType::Float),
            "bool" => Some(FieldType::Bool),
            _ => None,
        }
    }

    /// Whether a JSON value satisfies this type. `float` takes only
    /// floating-point JSON numbers, so `5` is an `int` and `5.0` is a `float`.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Str => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64(),
            FieldType::Bool => value.is_boolean(),
        }
    }
}

/// JSON type name used when reporting a mismatch.
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A fired event as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub trigger_id: i64,
    pub status: EventStatus,
    pub payload: Payload,
    pub is_test: bool,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

/// An event about to be persisted. The store assigns the id and the Active status.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub trigger_id: i64,
    pub payload: Payload,
    pub is_test: bool,
    pub triggered_at: DateTime<Utc>,
}

/// Pagination and visibility for event listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    pub show_test: bool,
    pub page: u32,
    pub page_size: u32,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            show_test: false,
            page: 1,
            page_size: 10,
        }
    }
}

pub const MAX_PAGE_SIZE: u32 = 100;

impl EventFilter {
    pub fn new(show_test: bool, page: u32, page_size: u32) -> Result<Self> {
        if page < 1 {
            return Err(TriggerdError::validation("page must be at least 1"));
        }
        if page_size < 1 || page_size > MAX_PAGE_SIZE {
            return Err(TriggerdError::validation(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(Self {
            show_test,
            page,
            page_size,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page.saturating_sub(1) as i64) * self.page_size as i64
    }

    /// Deterministic key for the recent-events cache.
    pub fn recent_cache_key(&self) -> String {
        format!(
            "{}show_test={}:page={}:size={}",
            RECENT_KEY_PREFIX, self.show_test, self.page, self.page_size
        )
    }
}

/// Key prefix shared by every cached recent-events page.
pub const RECENT_KEY_PREFIX: &str = "recent:";
