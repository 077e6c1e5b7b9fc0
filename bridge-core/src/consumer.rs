//! Inbound consumer: a single-threaded cooperative poll loop.
//!
//! Each delivered message runs through [`MessageProcessor::process`] to a
//! terminal audit status, then its offset is committed synchronously. A
//! message that cannot be processed is dead-lettered and its offset still
//! committed, so one poison message never blocks the partition. The loop
//! checks its cancellation token between polls, which bounds shutdown
//! latency by the poll timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audit::{AuditStore, Direction, NewMessageLog};
use crate::codec::{self, EnvelopeCodec};
use crate::correlation::CorrelationService;
use crate::error::BridgeError;
use crate::handlers::{self, ActionDispatcher, HandlerSet};
use crate::health::HealthHandle;
use crate::idempotency;
use crate::kafka::{InboundMessage, MessageSink, MessageSource, Polled};
use crate::metrics_consts::{
    CONSUME_FAILURES, CONSUME_TIME, DEAD_LETTERS, DUPLICATES_SUPPRESSED, HANDLER_SKIPS,
    MESSAGES_CONSUMED,
};
use crate::schema::SchemaCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A prior terminal-success row existed; nothing was written.
    Duplicate,
    Processed,
    Skipped,
    DeadLetter,
    Failed,
}

pub struct MessageProcessor {
    audit: Arc<dyn AuditStore>,
    schemas: Arc<SchemaCache>,
    codec: Arc<EnvelopeCodec>,
    handlers: HandlerSet,
    dispatcher: ActionDispatcher,
    correlation: CorrelationService,
    /// Undecodable messages are republished here when configured.
    dead_letter_sink: Option<(Arc<dyn MessageSink>, String)>,
    snapshot_payloads: bool,
}

impl MessageProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audit: Arc<dyn AuditStore>,
        schemas: Arc<SchemaCache>,
        codec: Arc<EnvelopeCodec>,
        handlers: HandlerSet,
        dispatcher: ActionDispatcher,
        correlation: CorrelationService,
        dead_letter_sink: Option<(Arc<dyn MessageSink>, String)>,
        snapshot_payloads: bool,
    ) -> Self {
        Self {
            audit,
            schemas,
            codec,
            handlers,
            dispatcher,
            correlation,
            dead_letter_sink,
            snapshot_payloads,
        }
    }

    /// Drive one message to a terminal audit status. An `Err` means the
    /// message could not even reach a `Pending` row; the loop boundary
    /// records it as a best-effort dead letter.
    pub async fn process(&self, message: &InboundMessage) -> Result<ProcessOutcome, BridgeError> {
        let key =
            idempotency::consumer_key(&message.topic, message.partition, message.offset)?;
        if self.audit.already_completed(&key).await? {
            counter!(DUPLICATES_SUPPRESSED, "direction" => "consumed").increment(1);
            info!(key, topic = %message.topic, offset = message.offset, "replayed message skipped");
            return Ok(ProcessOutcome::Duplicate);
        }

        let envelope = self.codec.decode(&message.payload).await?;

        let entry = self
            .audit
            .create(
                Direction::Consumed,
                NewMessageLog {
                    idempotency_key: key,
                    topic: message.topic.clone(),
                    tenant_id: envelope.tenant_id.clone(),
                    event_type: Some(envelope.event_type.clone()),
                    kafka_partition: Some(message.partition),
                    kafka_offset: Some(message.offset),
                    ..NewMessageLog::default()
                },
            )
            .await?;

        let payload = match self.decode_payload(&envelope).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    schema = %envelope.dataschema,
                    offset = message.offset,
                    error = %err,
                    "inner payload undecodable, dead-lettering"
                );
                self.audit.mark_dead_letter(entry.id, &err.to_string()).await?;
                counter!(DEAD_LETTERS).increment(1);
                self.republish_dead_letter(message).await;
                return Ok(ProcessOutcome::DeadLetter);
            }
        };

        if self.snapshot_payloads {
            self.audit.set_payload(entry.id, &payload).await?;
        }
        let business_key = payload
            .get("externalId")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        if let Some(business_key) = &business_key {
            self.audit.set_business_key(entry.id, business_key).await?;
        }

        let Some(handler) = self.handlers.find_handler(&envelope.event_type) else {
            counter!(HANDLER_SKIPS, "reason" => "no_handler").increment(1);
            self.audit
                .mark_skipped(entry.id, &format!("no handler for {}", envelope.event_type))
                .await?;
            return Ok(ProcessOutcome::Skipped);
        };
        self.audit.set_handler(entry.id, &handler.name).await?;

        match handlers::evaluate_guard(handler, &payload, &envelope) {
            Ok(true) => {}
            Ok(false) => {
                counter!(HANDLER_SKIPS, "reason" => "guard").increment(1);
                self.audit
                    .mark_skipped(entry.id, "handler guard evaluated false")
                    .await?;
                return Ok(ProcessOutcome::Skipped);
            }
            Err(err) => {
                self.audit.mark_failed(entry.id, &err.to_string()).await?;
                counter!(CONSUME_FAILURES).increment(1);
                return Ok(ProcessOutcome::Failed);
            }
        }

        self.dispatcher.dispatch(handler, &payload, &envelope).await;
        self.audit.mark_processed(entry.id).await?;
        counter!(MESSAGES_CONSUMED, "event" => envelope.event_type.clone()).increment(1);

        if let Some(business_key) = &business_key {
            self.correlation.correlate_best_effort(business_key).await;
        }
        Ok(ProcessOutcome::Processed)
    }

    async fn decode_payload(
        &self,
        envelope: &crate::codec::Envelope,
    ) -> Result<JsonValue, BridgeError> {
        let schema = self.schemas.resolve(&envelope.dataschema).await?;
        let inner = codec::decode_inner(&schema, &envelope.data)?;
        Ok(codec::avro_to_json(&inner))
    }

    async fn republish_dead_letter(&self, message: &InboundMessage) {
        let Some((sink, topic)) = &self.dead_letter_sink else {
            return;
        };
        let key = format!("{}:{}:{}", message.topic, message.partition, message.offset);
        if let Err(err) = sink.produce(topic, &key, &message.payload).await {
            warn!(topic, error = %err, "dead letter republication failed");
        }
    }

    /// Best-effort terminal record for a message that failed before a
    /// `Pending` row existed.
    pub async fn record_dead_letter(&self, message: &InboundMessage, error: &BridgeError) {
        let Ok(key) =
            idempotency::consumer_key(&message.topic, message.partition, message.offset)
        else {
            return;
        };
        let created = self
            .audit
            .create(
                Direction::Consumed,
                NewMessageLog {
                    idempotency_key: key,
                    topic: message.topic.clone(),
                    tenant_id: String::new(),
                    kafka_partition: Some(message.partition),
                    kafka_offset: Some(message.offset),
                    ..NewMessageLog::default()
                },
            )
            .await;
        match created {
            Ok(entry) => {
                if let Err(err) = self.audit.mark_dead_letter(entry.id, &error.to_string()).await
                {
                    warn!(error = %err, "could not finalize dead letter row");
                }
                counter!(DEAD_LETTERS).increment(1);
            }
            Err(err) => warn!(error = %err, "could not record dead letter row"),
        }
    }
}

pub struct ConsumerLoop {
    source: Arc<dyn MessageSource>,
    processor: Arc<MessageProcessor>,
    poll_timeout: Duration,
    shutdown: CancellationToken,
    health: Option<HealthHandle>,
    /// Stop after this many delivered messages; `None` runs until shutdown.
    max_messages: Option<usize>,
}

impl ConsumerLoop {
    pub fn new(
        source: Arc<dyn MessageSource>,
        processor: Arc<MessageProcessor>,
        poll_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            processor,
            poll_timeout,
            shutdown,
            health: None,
            max_messages: None,
        }
    }

    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = Some(max_messages);
        self
    }

    pub async fn run(&self) -> Result<(), BridgeError> {
        let mut handled = 0usize;
        info!("consumer loop started");
        loop {
            if self.shutdown.is_cancelled() {
                info!("consumer loop shutting down");
                return Ok(());
            }
            if let Some(health) = &self.health {
                health.report_healthy();
            }

            let message = match self.source.poll(self.poll_timeout).await {
                Ok(Polled::Empty) | Ok(Polled::EndOfPartition) => continue,
                Err(err) => {
                    error!(error = %err, "poll failed, continuing");
                    continue;
                }
                Ok(Polled::Message(message)) => message,
            };

            let started = Instant::now();
            match self.processor.process(&message).await {
                Ok(outcome) => {
                    histogram!(CONSUME_TIME).record(started.elapsed().as_secs_f64());
                    if outcome == ProcessOutcome::Failed {
                        warn!(
                            topic = %message.topic,
                            offset = message.offset,
                            "message failed, offset committed after terminal status"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        topic = %message.topic,
                        offset = message.offset,
                        error = %err,
                        "message processing aborted, recording dead letter"
                    );
                    self.processor.record_dead_letter(&message, &err).await;
                }
            }
            if let Err(err) = self.source.commit(&message).await {
                error!(offset = message.offset, error = %err, "offset commit failed");
            }

            handled += 1;
            if self.max_messages.is_some_and(|max| handled >= max) {
                info!(handled, "consumer loop reached its message bound");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogStatus;
    use crate::test_utils::{handler_named, BridgeHarness, ScriptedSource};

    #[tokio::test]
    async fn processed_message_reaches_processed_and_dispatches() {
        let harness = BridgeHarness::new().await;
        let message = harness.inbound_event("ClientActivated", 0).await;

        let processor = harness.processor(vec![handler_named("sync", "ClientActivated")]);
        let outcome = processor.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let row = harness.audit.latest().unwrap();
        assert_eq!(row.status, LogStatus::Processed);
        assert_eq!(row.handler_name.as_deref(), Some("sync"));
        assert_eq!(harness.submitter.submissions().len(), 1);
    }

    #[tokio::test]
    async fn event_without_a_handler_is_skipped() {
        let harness = BridgeHarness::new().await;
        let message = harness.inbound_event("ClientRejected", 0).await;

        let processor = harness.processor(vec![handler_named("sync", "ClientActivated")]);
        let outcome = processor.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped);

        let row = harness.audit.latest().unwrap();
        assert_eq!(row.status, LogStatus::Skipped);
        assert!(harness.submitter.submissions().is_empty());
    }

    #[tokio::test]
    async fn replay_after_processed_writes_nothing_and_dispatches_nothing() {
        let harness = BridgeHarness::new().await;
        let message = harness.inbound_event("ClientActivated", 7).await;
        let processor = harness.processor(vec![handler_named("sync", "ClientActivated")]);

        processor.process(&message).await.unwrap();
        let rows_before = harness.audit.rows().len();
        let submissions_before = harness.submitter.submissions().len();

        let outcome = processor.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Duplicate);
        assert_eq!(harness.audit.rows().len(), rows_before);
        assert_eq!(harness.submitter.submissions().len(), submissions_before);
    }

    #[tokio::test]
    async fn undecodable_inner_payload_dead_letters() {
        let harness = BridgeHarness::new().await;
        // The envelope declares a schema no tier can resolve, so the inner
        // payload cannot be decoded.
        let message = harness
            .inbound_event_with_schema("ClientActivated", "UnknownSchema", 0)
            .await;

        let processor = harness.processor(vec![handler_named("sync", "ClientActivated")]);
        let outcome = processor.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::DeadLetter);
        assert_eq!(harness.audit.latest().unwrap().status, LogStatus::DeadLetter);
    }

    #[tokio::test]
    async fn guard_evaluation_error_fails_the_message() {
        let harness = BridgeHarness::new().await;
        let message = harness.inbound_event("ClientActivated", 0).await;

        let mut handler = handler_named("guarded", "ClientActivated");
        handler.condition = Some("ambient.global == 1".to_string());
        let processor = harness.processor(vec![handler]);

        let outcome = processor.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);
        assert_eq!(harness.audit.latest().unwrap().status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn falsy_guard_skips_the_message() {
        let harness = BridgeHarness::new().await;
        let message = harness.inbound_event("ClientActivated", 0).await;

        let mut handler = handler_named("guarded", "ClientActivated");
        handler.condition = Some("payload.clientId > 100".to_string());
        let processor = harness.processor(vec![handler]);

        let outcome = processor.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(harness.audit.latest().unwrap().status, LogStatus::Skipped);
    }

    #[tokio::test]
    async fn loop_dead_letters_garbage_and_keeps_consuming() {
        let harness = BridgeHarness::new().await;
        let good = harness.inbound_event("ClientActivated", 1).await;
        let garbage = InboundMessage {
            topic: "fineract.events".to_string(),
            partition: 0,
            offset: 0,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        };

        let source = Arc::new(ScriptedSource::new(vec![garbage, good]));
        let processor = Arc::new(harness.processor(vec![handler_named("sync", "ClientActivated")]));
        let consumer = ConsumerLoop::new(
            source.clone(),
            processor,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .with_max_messages(2);

        consumer.run().await.unwrap();

        // Both offsets committed, garbage dead-lettered, good one processed.
        assert_eq!(source.committed(), vec![0, 1]);
        let rows = harness.audit.rows();
        assert!(rows.iter().any(|row| row.status == LogStatus::DeadLetter));
        assert!(rows.iter().any(|row| row.status == LogStatus::Processed));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_between_polls() {
        let harness = BridgeHarness::new().await;
        let source = Arc::new(ScriptedSource::new(vec![]));
        let processor = Arc::new(harness.processor(vec![]));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let consumer = ConsumerLoop::new(
            source,
            processor,
            Duration::from_millis(10),
            shutdown,
        );
        consumer.run().await.unwrap();
    }

    #[tokio::test]
    async fn processed_sides_sharing_a_business_key_get_correlated() {
        let harness = BridgeHarness::new().await;
        // Produce first so a Produced row with the business key exists.
        let rule = crate::test_utils::rule_named("create");
        let key = crate::idempotency::producer_key(
            "Customer",
            "CUST-0001",
            rule.event.as_str(),
            &rule.command_type,
            &rule.name,
        )
        .unwrap();
        harness
            .producer()
            .produce(&crate::test_utils::customer_doc(), &rule, &key)
            .await
            .unwrap();

        let message = harness.inbound_event("ClientActivated", 3).await;
        let processor = harness.processor(vec![handler_named("sync", "ClientActivated")]);
        processor.process(&message).await.unwrap();

        let rows = harness.audit.rows();
        let produced = rows
            .iter()
            .find(|row| row.status == LogStatus::Delivered)
            .unwrap();
        let consumed = rows
            .iter()
            .find(|row| row.status == LogStatus::Processed)
            .unwrap();
        assert_eq!(produced.correlated_id, Some(consumed.id));
        assert_eq!(consumed.correlated_id, Some(produced.id));
    }
}
