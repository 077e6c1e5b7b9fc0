//! Bridge configuration data model: emission rules, field mappings, event
//! handlers and actions. These are loaded from operator-supplied JSON and
//! validated up front so a malformed rule fails at load time, not mid-flight.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;

/// Document lifecycle events that can trigger outbound emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocEvent {
    AfterInsert,
    OnUpdate,
    OnSubmit,
    OnCancel,
    OnTrash,
}

impl DocEvent {
    /// Maps host-application event names onto the closed set we handle.
    /// Unknown events are simply not bridged.
    pub fn from_host_event(name: &str) -> Option<Self> {
        match name {
            "after_insert" => Some(Self::AfterInsert),
            "on_update" => Some(Self::OnUpdate),
            "on_submit" => Some(Self::OnSubmit),
            "on_cancel" => Some(Self::OnCancel),
            "on_trash" => Some(Self::OnTrash),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AfterInsert => "after_insert",
            Self::OnUpdate => "on_update",
            Self::OnSubmit => "on_submit",
            Self::OnCancel => "on_cancel",
            Self::OnTrash => "on_trash",
        }
    }
}

impl fmt::Display for DocEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target primitive type for a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvroType {
    String,
    Int,
    Long,
    Boolean,
    Bytes,
}

impl AvroType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long => "long",
            Self::Boolean => "boolean",
            Self::Bytes => "bytes",
        }
    }
}

/// Where a mapped field's raw value comes from. Closed set: an unrecognized
/// variant is a deserialization error, never a silent no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingSource {
    /// Direct attribute read off the document.
    Field { field: String },
    /// Sandboxed expression over the bound document or payload.
    Expression { expression: String },
    /// Literal value used as-is.
    Static { value: Value },
    /// Named pure function looked up in the method registry.
    Method { method: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub target_field: String,
    pub avro_type: AvroType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(flatten)]
    pub source: MappingSource,
}

impl FieldMapping {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.target_field.is_empty() {
            return Err(BridgeError::Validation(
                "field mapping has an empty target field".into(),
            ));
        }
        match &self.source {
            MappingSource::Field { field } if field.is_empty() => Err(BridgeError::Validation(
                format!("mapping {:?} has an empty source field", self.target_field),
            )),
            MappingSource::Expression { expression } if expression.is_empty() => {
                Err(BridgeError::Validation(format!(
                    "mapping {:?} has an empty expression",
                    self.target_field
                )))
            }
            MappingSource::Method { method } if method.is_empty() => Err(BridgeError::Validation(
                format!("mapping {:?} has an empty method name", self.target_field),
            )),
            _ => Ok(()),
        }
    }
}

/// Outbound trigger: entity event in, command message out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRule {
    pub name: String,
    pub entity_type: String,
    pub event: DocEvent,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower priority evaluates first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition: Option<String>,
    pub command_type: String,
    pub category: String,
    /// Inner payload schema, by name.
    pub schema_name: String,
    #[serde(default)]
    pub topic_override: Option<String>,
    #[serde(default)]
    pub tenant_override: Option<String>,
    pub mappings: Vec<FieldMapping>,
}

impl EmissionRule {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.name.is_empty() {
            return Err(BridgeError::Validation("rule has an empty name".into()));
        }
        if self.entity_type.is_empty() || self.command_type.is_empty() {
            return Err(BridgeError::Validation(format!(
                "rule {:?} is missing entity type or command type",
                self.name
            )));
        }
        if self.schema_name.is_empty() {
            return Err(BridgeError::Validation(format!(
                "rule {:?} has no schema name",
                self.name
            )));
        }
        if self.mappings.is_empty() {
            return Err(BridgeError::Validation(format!(
                "rule {:?} has no field mappings",
                self.name
            )));
        }
        for mapping in &self.mappings {
            mapping.validate()?;
        }
        Ok(())
    }
}

/// What an inbound handler does with a matched event. Per-action `enabled`
/// flags let operators switch one action off without touching its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    /// Submit a named background job with the decoded payload as context.
    SyncJob { job: String, queue: String },
    /// Submit a named function call through the job system.
    MethodCall { method: String, queue: String },
    /// Create a document of `entity_type` from payload field mappings.
    CreateDocument {
        entity_type: String,
        field_map: Map<String, Value>,
    },
    /// Update the document found by `correlation_field` equality.
    UpdateDocument {
        entity_type: String,
        field_map: Map<String, Value>,
        correlation_field: String,
    },
}

/// Inbound trigger: one business-event type string, guarded, fanning out to
/// ordered actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandler {
    pub name: String,
    pub event_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub condition: Option<String>,
    pub actions: Vec<ActionSpec>,
}

impl EventHandler {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.name.is_empty() || self.event_type.is_empty() {
            return Err(BridgeError::Validation(
                "handler is missing a name or event type".into(),
            ));
        }
        if self.actions.is_empty() {
            return Err(BridgeError::Validation(format!(
                "handler {:?} has no actions",
                self.name
            )));
        }
        for action in &self.actions {
            match &action.kind {
                ActionKind::SyncJob { job, queue } if job.is_empty() || queue.is_empty() => {
                    return Err(BridgeError::Validation(format!(
                        "handler {:?} has a sync job action missing job or queue",
                        self.name
                    )));
                }
                ActionKind::MethodCall { method, queue }
                    if method.is_empty() || queue.is_empty() =>
                {
                    return Err(BridgeError::Validation(format!(
                        "handler {:?} has a method call action missing method or queue",
                        self.name
                    )));
                }
                ActionKind::CreateDocument { entity_type, .. } if entity_type.is_empty() => {
                    return Err(BridgeError::Validation(format!(
                        "handler {:?} has a create action with no entity type",
                        self.name
                    )));
                }
                ActionKind::UpdateDocument {
                    entity_type,
                    correlation_field,
                    ..
                } if entity_type.is_empty() || correlation_field.is_empty() => {
                    return Err(BridgeError::Validation(format!(
                        "handler {:?} has an update action missing entity type or correlation field",
                        self.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A document handle as read from the host application: entity type, id,
/// and a flat JSON view of its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub entity_type: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn as_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

fn default_enabled() -> bool {
    true
}
