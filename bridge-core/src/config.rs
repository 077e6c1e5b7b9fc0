use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::BridgeError;
use crate::types::{EmissionRule, EventHandler};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_HOSTS", default = "kafka:9092")]
    pub kafka_hosts: String,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    #[envconfig(from = "KAFKA_PRODUCER_LINGER_MS", default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT_MS", default = "10000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "fineract-bridge")]
    pub kafka_consumer_group: String,
}

impl KafkaConfig {
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            );
        if self.kafka_tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        config
    }
}

#[derive(Envconfig, Clone)]
pub struct BridgeConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "COMMAND_TOPIC", default = "fineract.commands")]
    pub command_topic: String,

    #[envconfig(from = "EVENTS_TOPIC", default = "fineract.events")]
    pub events_topic: String,

    /// Optional topic where undecodable inbound messages are republished.
    #[envconfig(from = "DEAD_LETTER_TOPIC")]
    pub dead_letter_topic: Option<String>,

    #[envconfig(from = "SOURCE_NAME", default = "openerp-fineract")]
    pub source_name: String,

    #[envconfig(from = "DEFAULT_TENANT_ID", default = "default")]
    pub default_tenant_id: String,

    #[envconfig(from = "SCHEMA_REGISTRY_URL", default = "http://schema-registry:8081")]
    pub schema_registry_url: String,

    #[envconfig(from = "AUTO_REGISTER_SCHEMAS", default = "true")]
    pub auto_register_schemas: bool,

    #[envconfig(from = "SCHEMA_CACHE_TTL_SECS", default = "3600")]
    pub schema_cache_ttl_secs: u64,

    #[envconfig(from = "CONSUMER_POLL_TIMEOUT_MS", default = "1000")]
    pub consumer_poll_timeout_ms: u64,

    /// Snapshot the resolved payload onto successful audit rows, not just
    /// failed ones. Off by default to keep the log lean.
    #[envconfig(from = "LOG_PAYLOAD_ON_SUCCESS", default = "false")]
    pub log_payload_on_success: bool,

    /// Audit rows stuck `Pending` longer than this are swept: re-enqueued
    /// while attempts remain, failed otherwise.
    #[envconfig(from = "STALE_PENDING_AFTER_SECS", default = "600")]
    pub stale_pending_after_secs: u64,

    #[envconfig(from = "MAX_PRODUCE_RETRIES", default = "5")]
    pub max_produce_retries: i32,

    #[envconfig(from = "LOG_RETENTION_DAYS", default = "30")]
    pub log_retention_days: i64,

    #[envconfig(from = "RULES_PATH", default = "rules.json")]
    pub rules_path: String,

    #[envconfig(from = "HANDLERS_PATH", default = "handlers.json")]
    pub handlers_path: String,
}

/// Load and validate emission rules from an operator-supplied JSON file.
pub fn load_rules(path: &str) -> Result<Vec<EmissionRule>, BridgeError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| BridgeError::Validation(format!("cannot read rules file {path}: {err}")))?;
    let rules: Vec<EmissionRule> = serde_json::from_str(&raw)
        .map_err(|err| BridgeError::Validation(format!("malformed rules file {path}: {err}")))?;
    for rule in &rules {
        rule.validate()?;
    }
    Ok(rules)
}

/// Load and validate event handlers from an operator-supplied JSON file.
pub fn load_handlers(path: &str) -> Result<Vec<EventHandler>, BridgeError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        BridgeError::Validation(format!("cannot read handlers file {path}: {err}"))
    })?;
    let handlers: Vec<EventHandler> = serde_json::from_str(&raw)
        .map_err(|err| BridgeError::Validation(format!("malformed handlers file {path}: {err}")))?;
    for handler in &handlers {
        handler.validate()?;
    }
    Ok(handlers)
}
