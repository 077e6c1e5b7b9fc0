//! Broker client ports.
//!
//! [`MessageSink`] produces with flush-then-return semantics: the call only
//! succeeds once the broker acknowledged the write and handed back the
//! partition and offset. [`MessageSource`] wraps a consumer with manual,
//! synchronous offset commits so an offset is only ever committed after its
//! message reached a terminal audit status.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::debug;

use crate::config::{BridgeConfig, KafkaConfig};
use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, BridgeError>;
}

/// One message pulled off the broker, detached from the consumer so the
/// processing path owns plain data.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum Polled {
    Message(InboundMessage),
    EndOfPartition,
    Empty,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn poll(&self, timeout: Duration) -> Result<Polled, BridgeError>;

    /// Commit the offset after `message`, synchronously.
    async fn commit(&self, message: &InboundMessage) -> Result<(), BridgeError>;
}

pub struct KafkaSink {
    producer: FutureProducer,
    ack_timeout: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig) -> Result<Self, BridgeError> {
        let producer: FutureProducer = config.client_config().create()?;
        Ok(Self {
            producer,
            ack_timeout: Duration::from_millis(config.kafka_message_timeout_ms as u64),
        })
    }

    /// Broker reachability check for startup.
    pub fn probe(&self) -> Result<(), BridgeError> {
        use rdkafka::producer::Producer;
        self.producer.client().fetch_metadata(None, self.ack_timeout)?;
        Ok(())
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, BridgeError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        let (partition, offset) = self
            .producer
            .send(record, self.ack_timeout)
            .await
            .map_err(|(err, _)| BridgeError::Kafka(err))?;
        debug!(topic, partition, offset, "message acknowledged");
        Ok(Delivery { partition, offset })
    }
}

pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    /// Build a subscribed consumer: auto-commit off, offsets are committed
    /// explicitly after each processed message.
    pub fn new(config: &BridgeConfig, topics: &[&str]) -> Result<Self, BridgeError> {
        let consumer: StreamConsumer = config
            .kafka
            .client_config()
            .set("group.id", &config.kafka.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(topics)?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(&self, timeout: Duration) -> Result<Polled, BridgeError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(Polled::Empty),
            Ok(Err(KafkaError::PartitionEOF(_))) => Ok(Polled::EndOfPartition),
            Ok(Err(err)) => Err(BridgeError::Kafka(err)),
            Ok(Ok(message)) => Ok(Polled::Message(InboundMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), BridgeError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer
            .commit(&offsets, rdkafka::consumer::CommitMode::Sync)?;
        Ok(())
    }
}
