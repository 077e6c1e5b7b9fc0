//! Producer pipeline: one call takes a matched rule from document to
//! acknowledged broker write, with the audit log carrying the attempt's
//! status from `Pending` to `Delivered` or `Failed`.
//!
//! The dedup check against the audit store is the at-most-once guarantee.
//! Network-level idempotence is not assumed; once a `Delivered`,
//! `Processed` or `Skipped` row exists for a key, this pipeline never
//! transmits for that key again.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value as JsonValue;
use tracing::{error, info};

use crate::audit::{AuditStore, Direction, NewMessageLog};
use crate::codec::{self, Envelope, EnvelopeCodec};
use crate::error::BridgeError;
use crate::kafka::{Delivery, MessageSink};
use crate::mapping::{self, MethodRegistry};
use crate::metrics_consts::{
    DUPLICATES_SUPPRESSED, MESSAGES_PRODUCED, PRODUCE_FAILURES, PRODUCE_TIME,
};
use crate::schema::SchemaCache;
use crate::types::{Document, EmissionRule};

#[derive(Debug, PartialEq)]
pub enum ProduceOutcome {
    Delivered(Delivery),
    /// A terminal-success row already existed for the key; nothing was sent.
    Duplicate,
}

pub struct ProducerPipeline {
    audit: Arc<dyn AuditStore>,
    schemas: Arc<SchemaCache>,
    codec: Arc<EnvelopeCodec>,
    sink: Arc<dyn MessageSink>,
    methods: MethodRegistry,
    source_name: String,
    command_topic: String,
    default_tenant: String,
    log_payload_on_success: bool,
}

impl ProducerPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audit: Arc<dyn AuditStore>,
        schemas: Arc<SchemaCache>,
        codec: Arc<EnvelopeCodec>,
        sink: Arc<dyn MessageSink>,
        methods: MethodRegistry,
        source_name: String,
        command_topic: String,
        default_tenant: String,
        log_payload_on_success: bool,
    ) -> Self {
        Self {
            audit,
            schemas,
            codec,
            sink,
            methods,
            source_name,
            command_topic,
            default_tenant,
            log_payload_on_success,
        }
    }

    pub async fn produce(
        &self,
        doc: &Document,
        rule: &EmissionRule,
        idempotency_key: &str,
    ) -> Result<ProduceOutcome, BridgeError> {
        if self.audit.already_completed(idempotency_key).await? {
            counter!(DUPLICATES_SUPPRESSED, "direction" => "produced").increment(1);
            info!(key = idempotency_key, rule = %rule.name, "duplicate produce suppressed");
            return Ok(ProduceOutcome::Duplicate);
        }

        let entry = self
            .audit
            .create(
                Direction::Produced,
                NewMessageLog {
                    idempotency_key: idempotency_key.to_string(),
                    topic: self.topic_for(rule).to_string(),
                    tenant_id: self.tenant_for(rule).to_string(),
                    event_type: Some(rule.command_type.clone()),
                    entity_type: Some(doc.entity_type.clone()),
                    entity_id: Some(doc.id.clone()),
                    rule_name: Some(rule.name.clone()),
                    ..NewMessageLog::default()
                },
            )
            .await?;

        let started = Instant::now();
        match self.attempt(doc, rule, idempotency_key, entry.id).await {
            Ok(delivery) => {
                self.audit
                    .mark_delivered(entry.id, delivery.partition, delivery.offset)
                    .await?;
                counter!(MESSAGES_PRODUCED, "command" => rule.command_type.clone()).increment(1);
                histogram!(PRODUCE_TIME).record(started.elapsed().as_secs_f64());
                info!(
                    key = idempotency_key,
                    rule = %rule.name,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "command delivered"
                );
                Ok(ProduceOutcome::Delivered(delivery))
            }
            Err(err) => {
                error!(key = idempotency_key, rule = %rule.name, error = %err, "produce failed");
                counter!(PRODUCE_FAILURES).increment(1);
                self.audit.mark_failed(entry.id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        doc: &Document,
        rule: &EmissionRule,
        idempotency_key: &str,
        entry_id: uuid::Uuid,
    ) -> Result<Delivery, BridgeError> {
        let payload = mapping::build_payload(doc, &rule.mappings, &self.methods)?;
        let payload_json = JsonValue::Object(
            payload
                .iter()
                .map(|(name, value)| (name.clone(), codec::avro_to_json(value)))
                .collect(),
        );

        if let Some(business_key) = payload_json.get("externalId").and_then(JsonValue::as_str) {
            self.audit.set_business_key(entry_id, business_key).await?;
        }
        if self.log_payload_on_success {
            self.audit.set_payload(entry_id, &payload_json).await?;
        }

        let schema = self.schemas.resolve(&rule.schema_name).await?;
        let inner = codec::encode_inner(&schema, &payload)?;

        let envelope = Envelope::new(
            &self.source_name,
            &rule.command_type,
            &rule.category,
            self.tenant_for(rule),
            idempotency_key,
            &rule.schema_name,
            inner,
        );
        let framed = self.codec.encode(&envelope).await?;

        self.sink
            .produce(self.topic_for(rule), idempotency_key, &framed)
            .await
    }

    fn topic_for<'a>(&'a self, rule: &'a EmissionRule) -> &'a str {
        rule.topic_override.as_deref().unwrap_or(&self.command_topic)
    }

    fn tenant_for<'a>(&'a self, rule: &'a EmissionRule) -> &'a str {
        rule.tenant_override.as_deref().unwrap_or(&self.default_tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogStatus;
    use crate::idempotency;
    use crate::test_utils::{
        customer_doc, rule_named, BridgeHarness, CLIENT_CREATE_SCHEMA,
    };

    fn key_for(rule: &EmissionRule) -> String {
        idempotency::producer_key(
            "Customer",
            "CUST-0001",
            rule.event.as_str(),
            &rule.command_type,
            &rule.name,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn delivers_and_records_partition_and_offset() {
        let harness = BridgeHarness::new().await;
        let rule = rule_named("create");
        let key = key_for(&rule);

        let outcome = harness
            .producer()
            .produce(&customer_doc(), &rule, &key)
            .await
            .unwrap();
        assert!(matches!(outcome, ProduceOutcome::Delivered(_)));

        let row = harness.audit.latest().unwrap();
        assert_eq!(row.status, LogStatus::Delivered);
        assert_eq!(row.idempotency_key, key);
        assert!(row.kafka_partition.is_some());
        assert!(row.kafka_offset.is_some());

        let sent = harness.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "fineract.commands");
        assert_eq!(sent[0].key, key);
        // Confluent framing on the wire.
        assert_eq!(sent[0].payload[0], 0x00);
    }

    #[tokio::test]
    async fn duplicate_key_never_transmits_twice() {
        let harness = BridgeHarness::new().await;
        let rule = rule_named("create");
        let key = key_for(&rule);
        let doc = customer_doc();

        harness.producer().produce(&doc, &rule, &key).await.unwrap();
        let second = harness.producer().produce(&doc, &rule, &key).await.unwrap();
        assert_eq!(second, ProduceOutcome::Duplicate);
        assert_eq!(harness.sink.sent().len(), 1);
        assert_eq!(harness.audit.rows().len(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_marks_the_row_failed_and_reraises() {
        let harness = BridgeHarness::new().await;
        let mut rule = rule_named("create");
        rule.schema_name = "NoSuchSchema".to_string();
        let key = key_for(&rule);

        let err = harness
            .producer()
            .produce(&customer_doc(), &rule, &key)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SchemaNotFound(_)));

        let row = harness.audit.latest().unwrap();
        assert_eq!(row.status, LogStatus::Failed);
        assert_eq!(row.retry_count, 1);
        assert!(harness.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_key_is_retryable_until_delivered() {
        let harness = BridgeHarness::new().await;
        let mut broken = rule_named("create");
        broken.schema_name = "NoSuchSchema".to_string();
        let rule = rule_named("create");
        let key = key_for(&rule);
        let doc = customer_doc();

        assert!(harness.producer().produce(&doc, &broken, &key).await.is_err());
        // A Failed row does not suppress the retry.
        let outcome = harness.producer().produce(&doc, &rule, &key).await.unwrap();
        assert!(matches!(outcome, ProduceOutcome::Delivered(_)));
        assert_eq!(harness.audit.rows().len(), 2);
        assert_eq!(harness.audit.latest().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn rule_overrides_beat_configured_defaults() {
        let harness = BridgeHarness::new().await;
        let mut rule = rule_named("create");
        rule.topic_override = Some("tenant-a.commands".to_string());
        rule.tenant_override = Some("tenant-a".to_string());
        let key = key_for(&rule);

        harness
            .producer()
            .produce(&customer_doc(), &rule, &key)
            .await
            .unwrap();

        assert_eq!(harness.sink.sent()[0].topic, "tenant-a.commands");
        let row = harness.audit.latest().unwrap();
        assert_eq!(row.tenant_id, "tenant-a");
        assert_eq!(row.topic, "tenant-a.commands");
    }

    #[tokio::test]
    async fn end_to_end_payload_round_trips_through_the_codec() {
        let harness = BridgeHarness::new().await;
        let rule = rule_named("create");
        let key = key_for(&rule);

        harness
            .producer()
            .produce(&customer_doc(), &rule, &key)
            .await
            .unwrap();

        let sent = harness.sink.sent();
        let envelope = harness.codec.decode(&sent[0].payload).await.unwrap();
        assert_eq!(envelope.event_type, "CreateClient");
        assert_eq!(envelope.dataschema, "ClientCreateCommand");
        assert_eq!(envelope.idempotency_key, key);

        let schema = apache_avro::Schema::parse_str(CLIENT_CREATE_SCHEMA).unwrap();
        let inner = codec::decode_inner(&schema, &envelope.data).unwrap();
        let json = codec::avro_to_json(&inner);
        assert_eq!(json["clientId"], 42);
        assert_eq!(json["firstname"], "John");
        assert_eq!(json["lastname"], "Doe");
    }
}
