//! Trigger registration and firing.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::ScheduledTriggerConfig;
use crate::error::{FieldMismatch, Result, TriggerdError};
use crate::schedule::parse_schedule;
use crate::store::EventStore;
use crate::types::{
    json_type_name, ApiSchema, Event, FieldType, NewEvent, Payload, Trigger, TriggerKind,
};

pub struct TriggerRegistry {
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
}

impl TriggerRegistry {
    pub fn new(store: Arc<EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn register_scheduled(&self, name: &str, schedule: &str) -> Result<Trigger> {
        let name = validate_name(name)?;
        let now = self.clock.now();
        parse_schedule(schedule, now).map_err(|e| TriggerdError::validation(e.to_string()))?;

        let trigger = self
            .store
            .insert_trigger(
                name,
                &TriggerKind::Scheduled {
                    schedule: schedule.trim().to_string(),
                },
                now,
            )
            .await?;
        info!(trigger_id = trigger.id, name = %trigger.name, schedule = %schedule, "Registered scheduled trigger");
        Ok(trigger)
    }

    /// Register an API trigger. `schema` maps field names to type tags
    /// (`str`, `int`, `float`, `bool`).
    pub async fn register_api(
        &self,
        name: &str,
        schema: &HashMap<String, String>,
    ) -> Result<Trigger> {
        let name = validate_name(name)?;
        let api_schema = parse_api_schema(schema)?;

        let trigger = self
            .store
            .insert_trigger(name, &TriggerKind::Api { api_schema }, self.clock.now())
            .await?;
        info!(trigger_id = trigger.id, name = %trigger.name, fields = schema.len(), "Registered API trigger");
        Ok(trigger)
    }

    /// Fire a trigger, persisting one Active event. Nothing is written on failure.
    pub async fn fire(&self, trigger_id: i64, payload: Payload, is_test: bool) -> Result<Event> {
        let trigger = self.store.get_trigger(trigger_id).await?;

        match &trigger.kind {
            TriggerKind::Api { api_schema } => validate_payload(api_schema, &payload)?,
            TriggerKind::Scheduled { .. } => {}
        }

        let event = self
            .store
            .insert_event(NewEvent {
                trigger_id,
                payload,
                is_test,
                triggered_at: self.clock.now(),
            })
            .await?;
        info!(
            trigger_id,
            event_id = event.id,
            is_test,
            "Trigger fired"
        );
        Ok(event)
    }

    pub async fn get(&self, trigger_id: i64) -> Result<Trigger> {
        self.store.get_trigger(trigger_id).await
    }

    pub async fn list(&self) -> Result<Vec<Trigger>> {
        self.store.list_triggers().await
    }

    pub async fn list_scheduled(&self) -> Result<Vec<Trigger>> {
        self.store.list_scheduled_triggers().await
    }

    pub async fn get_event(&self, event_id: i64) -> Result<Event> {
        self.store.get_event(event_id, self.clock.now()).await
    }

    /// Register configured scheduled triggers whose name is not taken yet.
    /// Invalid entries are logged and skipped.
    pub async fn seed_from_config(&self, triggers: &[ScheduledTriggerConfig]) -> Result<usize> {
        let mut created = 0;
        for entry in triggers {
            if self.store.find_trigger_by_name(&entry.name).await?.is_some() {
                continue;
            }
            match self.register_scheduled(&entry.name, &entry.schedule).await {
                Ok(_) => created += 1,
                Err(TriggerdError::Validation(msg)) => {
                    warn!(name = %entry.name, schedule = %entry.schedule, "Skipping configured trigger: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TriggerdError::validation("trigger name must not be empty"));
    }
    Ok(name)
}

fn parse_api_schema(schema: &HashMap<String, String>) -> Result<ApiSchema> {
    if schema.is_empty() {
        return Err(TriggerdError::validation("api_schema must not be empty"));
    }

    let mut parsed = ApiSchema::new();
    let mut unsupported = Vec::new();
    for (field, tag) in schema {
        if field.trim().is_empty() {
            return Err(TriggerdError::validation("api_schema field names must not be empty"));
        }
        match FieldType::from_tag(tag.trim()) {
            Some(ty) => {
                parsed.insert(field.clone(), ty);
            }
            None => unsupported.push(format!("{}: {}", field, tag)),
        }
    }

    if !unsupported.is_empty() {
        unsupported.sort();
        return Err(TriggerdError::validation(format!(
            "unsupported type tags in api_schema ({})",
            unsupported.join(", ")
        )));
    }
    Ok(parsed)
}

/// Keys must match the schema exactly and every value must have the declared type.
pub(crate) fn validate_payload(schema: &ApiSchema, payload: &Payload) -> Result<()> {
    let mut fields = Vec::new();

    for (field, expected) in schema {
        match payload.get(field) {
            None => fields.push(FieldMismatch {
                field: field.clone(),
                expected: Some(expected.as_str().to_string()),
                found: "missing".to_string(),
            }),
            Some(value) if !expected.matches(value) => fields.push(FieldMismatch {
                field: field.clone(),
                expected: Some(expected.as_str().to_string()),
                found: json_type_name(value).to_string(),
            }),
            Some(_) => {}
        }
    }

    let mut extra: Vec<&String> = payload
        .keys()
        .filter(|key| !schema.contains_key(*key))
        .collect();
    extra.sort();
    for field in extra {
        fields.push(FieldMismatch {
            field: field.clone(),
            expected: None,
            found: json_type_name(&payload[field]).to_string(),
        });
    }

    if fields.is_empty() {
        Ok(())
    } else {
        Err(TriggerdError::SchemaValidation { fields })
    }
}
