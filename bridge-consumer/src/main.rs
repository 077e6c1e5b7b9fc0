//! Consumer daemon: a single-threaded poll loop over the business-event
//! topic, with liveness and metrics served over axum and an orderly
//! shutdown on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use bridge_core::audit::PgAuditStore;
use bridge_core::codec::EnvelopeCodec;
use bridge_core::config::load_handlers;
use bridge_core::consumer::{ConsumerLoop, MessageProcessor};
use bridge_core::correlation::CorrelationService;
use bridge_core::documents::PgDocumentStore;
use bridge_core::handlers::{ActionDispatcher, HandlerSet};
use bridge_core::health::HealthRegistry;
use bridge_core::jobs::PgJobSubmitter;
use bridge_core::kafka::{KafkaSink, KafkaSource, MessageSink};
use bridge_core::registry::{RestSchemaRegistry, SchemaRegistry as _};
use bridge_core::schema::{PgSchemaStore, SchemaCache};
use bridge_core::serve::{serve, service_router};

use crate::config::Config;

mod config;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_liveness_server(config: &Config, liveness: HealthRegistry) -> JoinHandle<()> {
    let bind = config.bind();
    let router = service_router(liveness);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let config = Config::init_from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.bridge.database_url)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("../bridge-core/migrations")
        .run(&pool)
        .await
        .context("running migrations")?;

    let audit = Arc::new(PgAuditStore::new(pool.clone()));
    let registry = Arc::new(RestSchemaRegistry::new(
        &config.bridge.schema_registry_url,
        reqwest::Client::new(),
    ));
    let schemas = Arc::new(SchemaCache::new(
        Duration::from_secs(config.bridge.schema_cache_ttl_secs),
        Arc::new(PgSchemaStore::new(pool.clone())),
        registry.clone(),
    ));
    let codec = Arc::new(EnvelopeCodec::new(
        registry.clone(),
        config.bridge.auto_register_schemas,
    ));

    registry
        .list_subjects()
        .await
        .context("reaching schema registry")?;

    let handlers = HandlerSet::new(load_handlers(&config.bridge.handlers_path)?)
        .context("loading event handlers")?;
    let dispatcher = ActionDispatcher::new(
        Arc::new(PgDocumentStore::new(pool.clone())),
        Arc::new(PgJobSubmitter::new(pool.clone())),
    );

    let dead_letter_sink = match &config.bridge.dead_letter_topic {
        Some(topic) => {
            let sink: Arc<dyn MessageSink> =
                Arc::new(KafkaSink::new(&config.bridge.kafka).context("creating DLQ producer")?);
            Some((sink, topic.clone()))
        }
        None => None,
    };

    let processor = Arc::new(MessageProcessor::new(
        audit.clone(),
        schemas,
        codec,
        handlers,
        dispatcher,
        CorrelationService::new(audit),
        dead_letter_sink,
        config.bridge.log_payload_on_success,
    ));

    let source = Arc::new(
        KafkaSource::new(&config.bridge, &[config.bridge.events_topic.as_str()])
            .context("creating kafka consumer")?,
    );

    let liveness = HealthRegistry::new();
    let health = liveness.register("consumer", Duration::from_secs(30));
    start_liveness_server(&config, liveness);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        } else {
            error!("could not listen for shutdown signal");
        }
    });

    let mut consumer = ConsumerLoop::new(
        source,
        processor,
        Duration::from_millis(config.bridge.consumer_poll_timeout_ms),
        shutdown,
    )
    .with_health(health);
    if config.max_messages > 0 {
        consumer = consumer.with_max_messages(config.max_messages);
    }

    info!(topic = %config.bridge.events_topic, "bridge consumer starting");
    consumer.run().await?;
    info!("bridge consumer stopped");
    Ok(())
}
