//! Inbound handler matching and action dispatch.
//!
//! One event type maps to at most one enabled handler. Its guard runs in
//! the expression sandbox over the decoded payload and the stripped
//! envelope; a guard error is a `Failed` outcome for the message, never a
//! silent skip. Actions then dispatch in declaration order with per-action
//! failure isolation, so one broken action cannot starve its siblings.

use std::sync::Arc;

use metrics::counter;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, warn};

use crate::codec::Envelope;
use crate::documents::DocumentStore;
use crate::error::BridgeError;
use crate::expr::{self, Scope};
use crate::jobs::JobSubmitter;
use crate::metrics_consts::ACTION_FAILURES;
use crate::types::{ActionKind, EventHandler};

/// Validated, immutable set of inbound handlers.
pub struct HandlerSet {
    handlers: Vec<EventHandler>,
}

impl HandlerSet {
    pub fn new(handlers: Vec<EventHandler>) -> Result<Self, BridgeError> {
        for handler in &handlers {
            handler.validate()?;
        }
        Ok(Self { handlers })
    }

    /// The single enabled handler whose event type matches exactly.
    pub fn find_handler(&self, event_type: &str) -> Option<&EventHandler> {
        self.handlers
            .iter()
            .find(|handler| handler.enabled && handler.event_type == event_type)
    }
}

/// Evaluate a handler's guard over the payload and envelope. `Ok(false)`
/// skips the message; `Err` fails it. The distinction matters: an
/// unevaluable guard is an operator problem that must surface.
pub fn evaluate_guard(
    handler: &EventHandler,
    payload: &JsonValue,
    envelope: &Envelope,
) -> Result<bool, BridgeError> {
    let Some(condition) = &handler.condition else {
        return Ok(true);
    };
    let scope = Scope::new()
        .bind("payload", payload.clone())
        .bind("envelope", envelope.stripped_json());
    Ok(expr::eval_bool(condition, &scope)?)
}

#[derive(Debug, Default, PartialEq)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub failed: usize,
}

pub struct ActionDispatcher {
    documents: Arc<dyn DocumentStore>,
    jobs: Arc<dyn JobSubmitter>,
}

impl ActionDispatcher {
    pub fn new(documents: Arc<dyn DocumentStore>, jobs: Arc<dyn JobSubmitter>) -> Self {
        Self { documents, jobs }
    }

    /// Run every enabled action. Failures are logged and counted but never
    /// abort the remaining actions; "handler dispatched" does not require
    /// every action to have succeeded.
    pub async fn dispatch(
        &self,
        handler: &EventHandler,
        payload: &JsonValue,
        envelope: &Envelope,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for (index, action) in handler.actions.iter().enumerate() {
            if !action.enabled {
                continue;
            }
            match self.run_action(&action.kind, payload, envelope).await {
                Ok(()) => summary.dispatched += 1,
                Err(err) => {
                    warn!(
                        handler = %handler.name,
                        action = index,
                        error = %err,
                        "action dispatch failed, continuing with remaining actions"
                    );
                    counter!(ACTION_FAILURES, "handler" => handler.name.clone()).increment(1);
                    summary.failed += 1;
                }
            }
        }
        info!(
            handler = %handler.name,
            dispatched = summary.dispatched,
            failed = summary.failed,
            "handler dispatched"
        );
        summary
    }

    async fn run_action(
        &self,
        action: &ActionKind,
        payload: &JsonValue,
        envelope: &Envelope,
    ) -> Result<(), BridgeError> {
        match action {
            ActionKind::SyncJob { job, queue } => {
                self.jobs
                    .submit(job, queue, job_context(payload, envelope))
                    .await
            }
            ActionKind::MethodCall { method, queue } => {
                self.jobs
                    .submit(method, queue, job_context(payload, envelope))
                    .await
            }
            ActionKind::CreateDocument {
                entity_type,
                field_map,
            } => {
                let fields = resolve_field_map(field_map, payload);
                self.documents.create(entity_type, fields).await?;
                Ok(())
            }
            ActionKind::UpdateDocument {
                entity_type,
                field_map,
                correlation_field,
            } => {
                let correlation_value = lookup_path(payload, correlation_field);
                if correlation_value.is_null() {
                    return Err(BridgeError::Validation(format!(
                        "correlation field {correlation_field:?} is missing from the payload"
                    )));
                }
                let target_field = correlation_field
                    .rsplit('.')
                    .next()
                    .unwrap_or(correlation_field);
                let target = self
                    .documents
                    .find_by_field(entity_type, target_field, &correlation_value)
                    .await?
                    .ok_or_else(|| BridgeError::NotFound {
                        entity: entity_type.clone(),
                        id: correlation_value.to_string(),
                    })?;
                let fields = resolve_field_map(field_map, payload);
                self.documents.update(entity_type, &target.id, fields).await
            }
        }
    }
}

/// Job context carried to the host job system: the decoded payload plus the
/// envelope without its binary data, to bound job size.
fn job_context(payload: &JsonValue, envelope: &Envelope) -> JsonValue {
    json!({
        "payload": payload,
        "envelope": envelope.stripped_json(),
    })
}

/// String values in a field map are dotted paths into the payload; any
/// other JSON value is a literal.
fn resolve_field_map(
    field_map: &Map<String, JsonValue>,
    payload: &JsonValue,
) -> Map<String, JsonValue> {
    field_map
        .iter()
        .map(|(target, source)| {
            let value = match source {
                JsonValue::String(path) => lookup_path(payload, path),
                literal => literal.clone(),
            };
            (target.clone(), value)
        })
        .collect()
}

fn lookup_path(payload: &JsonValue, path: &str) -> JsonValue {
    let mut current = payload;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return JsonValue::Null,
        }
    }
    current.clone()
}
