//! In-memory doubles for the bridge's ports, plus a preassembled harness.
//! Used by unit tests across the crate; nothing here talks to a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;

use crate::audit::{AuditStore, Direction, LogStatus, MessageLog, NewMessageLog};
use crate::codec::{self, Envelope, EnvelopeCodec};
use crate::consumer::MessageProcessor;
use crate::correlation::CorrelationService;
use crate::documents::DocumentStore;
use crate::error::BridgeError;
use crate::handlers::{ActionDispatcher, HandlerSet};
use crate::jobs::{JobQueue, JobSubmitter, ProduceJob, QueuedProduceJob};
use crate::kafka::{Delivery, InboundMessage, MessageSink, MessageSource, Polled};
use crate::mapping::MethodRegistry;
use crate::producer::ProducerPipeline;
use crate::registry::{RegisteredSchema, SchemaRegistry};
use crate::schema::{SchemaCache, SchemaStore, StoredSchema};
use crate::types::{
    ActionKind, ActionSpec, AvroType, DocEvent, Document, EmissionRule, EventHandler,
    FieldMapping, MappingSource,
};

pub const CLIENT_CREATE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "ClientCreateCommand",
    "fields": [
        {"name": "clientId", "type": "long"},
        {"name": "firstname", "type": "string"},
        {"name": "lastname", "type": "string"},
        {"name": "externalId", "type": "string"}
    ]
}"#;

pub const CLIENT_EVENT_SCHEMA: &str = r#"{
    "type": "record",
    "name": "ClientEventV1",
    "fields": [
        {"name": "clientId", "type": "long"},
        {"name": "externalId", "type": "string"}
    ]
}"#;

pub fn customer_doc() -> Document {
    Document::new("Customer", "CUST-0001")
        .with_field("fineract_client_id", json!(42))
        .with_field("first_name", json!("John"))
        .with_field("last_name", json!("Doe"))
        .with_field("external_id", json!("EXT-9"))
}

fn field_mapping(target: &str, source: &str, avro_type: AvroType) -> FieldMapping {
    FieldMapping {
        target_field: target.to_string(),
        avro_type,
        nullable: false,
        default_value: None,
        source: MappingSource::Field {
            field: source.to_string(),
        },
    }
}

pub fn rule_named(name: &str) -> EmissionRule {
    EmissionRule {
        name: name.to_string(),
        entity_type: "Customer".to_string(),
        event: DocEvent::AfterInsert,
        enabled: true,
        priority: 0,
        condition: None,
        command_type: "CreateClient".to_string(),
        category: "clients".to_string(),
        schema_name: "ClientCreateCommand".to_string(),
        topic_override: None,
        tenant_override: None,
        mappings: vec![
            field_mapping("clientId", "fineract_client_id", AvroType::Long),
            field_mapping("firstname", "first_name", AvroType::String),
            field_mapping("lastname", "last_name", AvroType::String),
            field_mapping("externalId", "external_id", AvroType::String),
        ],
    }
}

pub fn handler_named(name: &str, event_type: &str) -> EventHandler {
    EventHandler {
        name: name.to_string(),
        event_type: event_type.to_string(),
        enabled: true,
        condition: None,
        actions: vec![ActionSpec {
            enabled: true,
            kind: ActionKind::SyncJob {
                job: "sync_client".to_string(),
                queue: "default".to_string(),
            },
        }],
    }
}

pub fn sample_envelope(event_type: &str) -> Envelope {
    Envelope::new(
        "fineract",
        event_type,
        "clients",
        "default",
        "0000",
        "ClientEventV1",
        Vec::new(),
    )
}

#[derive(Default)]
pub struct InMemorySchemaStore {
    schemas: Mutex<HashMap<String, (i32, String)>>,
}

#[async_trait]
impl SchemaStore for InMemorySchemaStore {
    async fn get_latest(&self, name: &str) -> Result<Option<StoredSchema>, BridgeError> {
        let schemas = self.schemas.lock().unwrap();
        Ok(schemas.get(name).map(|(version, body)| StoredSchema {
            name: name.to_string(),
            version: *version,
            body: body.clone(),
        }))
    }

    async fn put_latest(&self, name: &str, version: i32, body: &str) -> Result<(), BridgeError> {
        self.schemas
            .lock()
            .unwrap()
            .insert(name.to_string(), (version, body.to_string()));
        Ok(())
    }

    async fn list_latest_names(&self) -> Result<Vec<String>, BridgeError> {
        let mut names: Vec<String> = self.schemas.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Registry double that counts lookups and keeps registered schemas
/// addressable by id, which is enough for the codec and cache tests.
#[derive(Default)]
pub struct CountingRegistry {
    subjects: Mutex<HashMap<String, (i32, String)>>,
    by_id: Mutex<HashMap<i32, String>>,
    next_id: AtomicI32,
    latest_calls: AtomicUsize,
    by_id_calls: AtomicUsize,
}

impl CountingRegistry {
    pub fn with_schema(subject: &str, schema: &str) -> Self {
        let registry = Self::default();
        registry.allocate(subject, schema);
        registry
    }

    fn allocate(&self, subject: &str, schema: &str) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.subjects
            .lock()
            .unwrap()
            .insert(subject.to_string(), (id, schema.to_string()));
        self.by_id.lock().unwrap().insert(id, schema.to_string());
        id
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }

    pub fn by_id_calls(&self) -> usize {
        self.by_id_calls.load(Ordering::SeqCst)
    }

    pub fn id_of(&self, subject: &str) -> Option<i32> {
        self.subjects.lock().unwrap().get(subject).map(|(id, _)| *id)
    }
}

#[async_trait]
impl SchemaRegistry for CountingRegistry {
    async fn get_latest(&self, subject: &str) -> Result<RegisteredSchema, BridgeError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        let subjects = self.subjects.lock().unwrap();
        match subjects.get(subject) {
            Some((id, schema)) => Ok(RegisteredSchema {
                id: *id,
                version: 1,
                schema: schema.clone(),
            }),
            None => Err(BridgeError::SchemaNotFound(subject.to_string())),
        }
    }

    async fn register(&self, subject: &str, schema: &str) -> Result<i32, BridgeError> {
        if let Some(id) = self.id_of(subject) {
            return Ok(id);
        }
        Ok(self.allocate(subject, schema))
    }

    async fn get_by_id(&self, id: i32) -> Result<String, BridgeError> {
        self.by_id_calls.fetch_add(1, Ordering::SeqCst);
        self.by_id
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| BridgeError::SchemaNotFound(format!("id {id}")))
    }

    async fn list_subjects(&self) -> Result<Vec<String>, BridgeError> {
        Ok(self.subjects.lock().unwrap().keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    rows: Mutex<Vec<MessageLog>>,
}

impl InMemoryAuditStore {
    pub fn rows(&self) -> Vec<MessageLog> {
        self.rows.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<MessageLog> {
        self.rows.lock().unwrap().last().cloned()
    }

    fn update<F: FnOnce(&mut MessageLog)>(&self, id: Uuid, apply: F) -> Result<(), BridgeError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| row.id == id) {
            apply(row);
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    fn transition(&self, id: Uuid, next: LogStatus, error: Option<&str>) -> Result<(), BridgeError> {
        self.update(id, |row| {
            if row.status.can_transition_to(next) {
                row.status = next;
                if let Some(error) = error {
                    row.error_message = Some(error.to_string());
                }
            }
        })
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create(
        &self,
        direction: Direction,
        entry: NewMessageLog,
    ) -> Result<MessageLog, BridgeError> {
        let mut rows = self.rows.lock().unwrap();
        let retry_count = rows
            .iter()
            .filter(|row| {
                row.idempotency_key == entry.idempotency_key && row.direction == direction
            })
            .count() as i32;
        let now = Utc::now();
        let row = MessageLog {
            id: Uuid::now_v7(),
            direction,
            status: LogStatus::Pending,
            idempotency_key: entry.idempotency_key,
            topic: entry.topic,
            kafka_partition: entry.kafka_partition,
            kafka_offset: entry.kafka_offset,
            tenant_id: entry.tenant_id,
            event_type: entry.event_type,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            rule_name: entry.rule_name,
            handler_name: None,
            business_key: None,
            payload: None,
            error_message: None,
            retry_count,
            correlated_id: None,
            created_at: now,
            updated_at: now,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn already_completed(&self, idempotency_key: &str) -> Result<bool, BridgeError> {
        Ok(self.rows.lock().unwrap().iter().any(|row| {
            row.idempotency_key == idempotency_key
                && LogStatus::TERMINAL_SUCCESS.contains(&row.status)
        }))
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        partition: i32,
        offset: i64,
    ) -> Result<(), BridgeError> {
        self.update(id, |row| {
            if row.status.can_transition_to(LogStatus::Delivered) {
                row.status = LogStatus::Delivered;
                row.kafka_partition = Some(partition);
                row.kafka_offset = Some(offset);
            }
        })
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), BridgeError> {
        self.transition(id, LogStatus::Processed, None)
    }

    async fn mark_skipped(&self, id: Uuid, reason: &str) -> Result<(), BridgeError> {
        self.transition(id, LogStatus::Skipped, Some(reason))
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), BridgeError> {
        self.update(id, |row| {
            if row.status.can_transition_to(LogStatus::Failed) {
                row.status = LogStatus::Failed;
                row.error_message = Some(error.to_string());
                row.retry_count += 1;
            }
        })
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), BridgeError> {
        self.transition(id, LogStatus::DeadLetter, Some(error))
    }

    async fn set_payload(&self, id: Uuid, payload: &JsonValue) -> Result<(), BridgeError> {
        let payload = payload.clone();
        self.update(id, |row| row.payload = Some(payload))
    }

    async fn set_handler(&self, id: Uuid, handler_name: &str) -> Result<(), BridgeError> {
        let handler_name = handler_name.to_string();
        self.update(id, |row| row.handler_name = Some(handler_name))
    }

    async fn set_business_key(&self, id: Uuid, business_key: &str) -> Result<(), BridgeError> {
        let business_key = business_key.to_string();
        self.update(id, |row| row.business_key = Some(business_key))
    }

    async fn set_correlated(&self, id: Uuid, other: Uuid) -> Result<(), BridgeError> {
        self.update(id, |row| row.correlated_id = Some(other))
    }

    async fn latest_for_business_key(
        &self,
        direction: Direction,
        business_key: &str,
    ) -> Result<Option<MessageLog>, BridgeError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|row| {
                row.direction == direction && row.business_key.as_deref() == Some(business_key)
            })
            .cloned())
    }

    async fn list_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MessageLog>, BridgeError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.status == LogStatus::Pending && row.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BridgeError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|row| row.status == LogStatus::Pending || row.updated_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

/// Job queue double mirroring the table semantics: the idempotency key is
/// unique across every row regardless of status, and a dequeued job stays
/// as a `running` row until completed, failed, or reclaimed.
#[derive(Default)]
pub struct InMemoryJobQueue {
    rows: Mutex<Vec<QueuedJobRow>>,
}

struct QueuedJobRow {
    job: QueuedProduceJob,
    running: bool,
    locked_at: Option<DateTime<Utc>>,
}

impl InMemoryJobQueue {
    pub fn jobs(&self) -> Vec<ProduceJob> {
        self.rows.lock().unwrap().iter().map(|row| row.job.job()).collect()
    }

    pub fn available(&self) -> Vec<ProduceJob> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| !row.running)
            .map(|row| row.job.job())
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &ProduceJob) -> Result<bool, BridgeError> {
        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|row| row.job.idempotency_key == job.idempotency_key)
        {
            return Ok(false);
        }
        rows.push(QueuedJobRow {
            job: QueuedProduceJob {
                id: Uuid::now_v7(),
                entity_type: job.entity_type.clone(),
                entity_id: job.entity_id.clone(),
                rule_name: job.rule_name.clone(),
                idempotency_key: job.idempotency_key.clone(),
                attempt: 0,
                created_at: Utc::now(),
            },
            running: false,
            locked_at: None,
        });
        Ok(true)
    }

    async fn dequeue(&self, limit: i64) -> Result<Vec<QueuedProduceJob>, BridgeError> {
        let mut rows = self.rows.lock().unwrap();
        let mut claimed = Vec::new();
        for row in rows.iter_mut().filter(|row| !row.running) {
            if claimed.len() as i64 >= limit {
                break;
            }
            row.running = true;
            row.locked_at = Some(Utc::now());
            row.job.attempt += 1;
            claimed.push(row.job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), BridgeError> {
        self.rows.lock().unwrap().retain(|row| row.job.id != id);
        Ok(())
    }

    async fn fail(&self, id: Uuid, _error: &str, max_attempts: i32) -> Result<(), BridgeError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| row.job.id == id) {
            if row.job.attempt < max_attempts {
                row.running = false;
                row.locked_at = None;
            }
        }
        Ok(())
    }

    async fn reclaim_stuck(&self, locked_before: DateTime<Utc>) -> Result<u64, BridgeError> {
        let mut rows = self.rows.lock().unwrap();
        let mut reclaimed = 0;
        for row in rows.iter_mut() {
            if row.running && row.locked_at.is_some_and(|at| at < locked_before) {
                row.running = false;
                row.locked_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub job_name: String,
    pub queue: String,
    pub context: JsonValue,
}

#[derive(Default)]
pub struct RecordingSubmitter {
    submissions: Mutex<Vec<Submission>>,
    fail_on: Option<String>,
}

impl RecordingSubmitter {
    pub fn failing_on(job_name: &str) -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            fail_on: Some(job_name.to_string()),
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSubmitter for RecordingSubmitter {
    async fn submit(
        &self,
        job_name: &str,
        queue: &str,
        context: JsonValue,
    ) -> Result<(), BridgeError> {
        if self.fail_on.as_deref() == Some(job_name) {
            return Err(BridgeError::Validation(format!(
                "job {job_name:?} rejected by test double"
            )));
        }
        self.submissions.lock().unwrap().push(Submission {
            job_name: job_name.to_string(),
            queue: queue.to_string(),
            context,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: Mutex<Vec<Document>>,
}

impl InMemoryDocumentStore {
    pub fn all(&self, entity_type: &str) -> Vec<Document> {
        self.documents
            .lock()
            .unwrap()
            .iter()
            .filter(|doc| doc.entity_type == entity_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Document>, BridgeError> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .find(|doc| doc.entity_type == entity_type && doc.id == id)
            .cloned())
    }

    async fn create(
        &self,
        entity_type: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<Document, BridgeError> {
        let doc = Document {
            entity_type: entity_type.to_string(),
            id: Uuid::now_v7().to_string(),
            fields,
        };
        self.documents.lock().unwrap().push(doc.clone());
        Ok(doc)
    }

    async fn find_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Option<Document>, BridgeError> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .find(|doc| doc.entity_type == entity_type && doc.field(field) == Some(value))
            .cloned())
    }

    async fn update(
        &self,
        entity_type: &str,
        id: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<(), BridgeError> {
        let mut documents = self.documents.lock().unwrap();
        let Some(doc) = documents
            .iter_mut()
            .find(|doc| doc.entity_type == entity_type && doc.id == id)
        else {
            return Err(BridgeError::NotFound {
                entity: entity_type.to_string(),
                id: id.to_string(),
            });
        };
        for (name, value) in fields {
            doc.fields.insert(name, value);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct FakeSink {
    sent: Mutex<Vec<SentMessage>>,
    next_offset: AtomicI64,
}

impl FakeSink {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for FakeSink {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, BridgeError> {
        self.sent.lock().unwrap().push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(Delivery {
            partition: 0,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        })
    }
}

/// A source that replays a fixed script of messages, then reports empty
/// polls, and records every committed offset.
pub struct ScriptedSource {
    messages: Mutex<VecDeque<InboundMessage>>,
    committed: Mutex<Vec<i64>>,
}

impl ScriptedSource {
    pub fn new(messages: Vec<InboundMessage>) -> Self {
        Self {
            messages: Mutex::new(messages.into()),
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn committed(&self) -> Vec<i64> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn poll(&self, _timeout: Duration) -> Result<Polled, BridgeError> {
        Ok(match self.messages.lock().unwrap().pop_front() {
            Some(message) => Polled::Message(message),
            None => Polled::Empty,
        })
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), BridgeError> {
        self.committed.lock().unwrap().push(message.offset);
        Ok(())
    }
}

/// Everything wired together against in-memory ports, matching how the
/// binaries assemble the real thing.
pub struct BridgeHarness {
    pub audit: Arc<InMemoryAuditStore>,
    pub store: Arc<InMemorySchemaStore>,
    pub registry: Arc<CountingRegistry>,
    pub schemas: Arc<SchemaCache>,
    pub codec: Arc<EnvelopeCodec>,
    pub sink: Arc<FakeSink>,
    pub submitter: Arc<RecordingSubmitter>,
    pub documents: Arc<InMemoryDocumentStore>,
}

impl BridgeHarness {
    pub async fn new() -> Self {
        let audit = Arc::new(InMemoryAuditStore::default());
        let store = Arc::new(InMemorySchemaStore::default());
        store
            .put_latest("ClientCreateCommand", 1, CLIENT_CREATE_SCHEMA)
            .await
            .unwrap();
        store
            .put_latest("ClientEventV1", 1, CLIENT_EVENT_SCHEMA)
            .await
            .unwrap();
        let registry = Arc::new(CountingRegistry::default());
        let schemas = Arc::new(SchemaCache::new(
            Duration::from_secs(60),
            store.clone(),
            registry.clone(),
        ));
        let codec = Arc::new(EnvelopeCodec::new(registry.clone(), true));
        Self {
            audit,
            store,
            registry,
            schemas,
            codec,
            sink: Arc::new(FakeSink::default()),
            submitter: Arc::new(RecordingSubmitter::default()),
            documents: Arc::new(InMemoryDocumentStore::default()),
        }
    }

    pub fn producer(&self) -> ProducerPipeline {
        ProducerPipeline::new(
            self.audit.clone(),
            self.schemas.clone(),
            self.codec.clone(),
            self.sink.clone(),
            MethodRegistry::new(),
            "openerp-fineract".to_string(),
            "fineract.commands".to_string(),
            "default".to_string(),
            true,
        )
    }

    pub fn processor(&self, handlers: Vec<EventHandler>) -> MessageProcessor {
        MessageProcessor::new(
            self.audit.clone(),
            self.schemas.clone(),
            self.codec.clone(),
            HandlerSet::new(handlers).unwrap(),
            ActionDispatcher::new(self.documents.clone(), self.submitter.clone()),
            CorrelationService::new(self.audit.clone()),
            None,
            true,
        )
    }

    pub async fn inbound_event(&self, event_type: &str, offset: i64) -> InboundMessage {
        self.inbound_event_with_schema(event_type, "ClientEventV1", offset)
            .await
    }

    /// Build a framed inbound message whose envelope declares
    /// `schema_name`, regardless of what the payload was encoded with.
    pub async fn inbound_event_with_schema(
        &self,
        event_type: &str,
        schema_name: &str,
        offset: i64,
    ) -> InboundMessage {
        let schema = apache_avro::Schema::parse_str(CLIENT_EVENT_SCHEMA).unwrap();
        let data = codec::encode_inner(
            &schema,
            &[
                (
                    "clientId".to_string(),
                    apache_avro::types::Value::Long(42),
                ),
                (
                    "externalId".to_string(),
                    apache_avro::types::Value::String("EXT-9".to_string()),
                ),
            ],
        )
        .unwrap();
        let envelope = Envelope::new(
            "fineract",
            event_type,
            "clients",
            "default",
            &format!("evt-{offset}"),
            schema_name,
            data,
        );
        InboundMessage {
            topic: "fineract.events".to_string(),
            partition: 0,
            offset,
            payload: self.codec.encode(&envelope).await.unwrap(),
        }
    }
}
