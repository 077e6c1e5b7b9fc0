//! Producer-side worker: pulls deferred produce jobs off the Postgres
//! queue and drives each one through the producer pipeline, alongside the
//! periodic audit sweep and schema refresh tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use envconfig::Envconfig;
use metrics::counter;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use bridge_core::audit::PgAuditStore;
use bridge_core::codec::EnvelopeCodec;
use bridge_core::config::load_rules;
use bridge_core::documents::{DocumentStore, PgDocumentStore};
use bridge_core::health::{HealthHandle, HealthRegistry};
use bridge_core::jobs::{JobQueue, PgJobQueue};
use bridge_core::kafka::KafkaSink;
use bridge_core::maintenance::Sweeper;
use bridge_core::mapping::MethodRegistry;
use bridge_core::metrics_consts::JOBS_DEQUEUED;
use bridge_core::producer::ProducerPipeline;
use bridge_core::registry::{RestSchemaRegistry, SchemaRegistry as _};
use bridge_core::rules::RuleSet;
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

async fn worker_loop(
    config: Config,
    queue: Arc<dyn JobQueue>,
    documents: Arc<dyn DocumentStore>,
    rules: Arc<RuleSet>,
    pipeline: Arc<ProducerPipeline>,
    health: HealthHandle,
) {
    let idle = Duration::from_millis(config.dequeue_interval_ms);
    loop {
        health.report_healthy();

        let jobs = match queue.dequeue(config.dequeue_batch_size).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "dequeue failed");
                tokio::time::sleep(idle).await;
                continue;
            }
        };
        if jobs.is_empty() {
            tokio::time::sleep(idle).await;
            continue;
        }
        counter!(JOBS_DEQUEUED).increment(jobs.len() as u64);

        for queued in jobs {
            let job = queued.job();
            let doc = match documents.get(&job.entity_type, &job.entity_id).await {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    // The triggering document is gone; the job can never
                    // succeed, so it is retired rather than retried.
                    warn!(
                        entity = %job.entity_type,
                        id = %job.entity_id,
                        "document vanished, retiring job"
                    );
                    if let Err(err) = queue.complete(queued.id).await {
                        error!(error = %err, "could not retire job");
                    }
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "document load failed");
                    if let Err(err) = queue
                        .fail(queued.id, &err.to_string(), config.bridge.max_produce_retries)
                        .await
                    {
                        error!(error = %err, "could not record job failure");
                    }
                    continue;
                }
            };

            let Some(rule) = rules.get(&job.rule_name) else {
                warn!(rule = %job.rule_name, "rule no longer configured, retiring job");
                if let Err(err) = queue.complete(queued.id).await {
                    error!(error = %err, "could not retire job");
                }
                continue;
            };

            match pipeline.produce(&doc, rule, &job.idempotency_key).await {
                Ok(_) => {
                    if let Err(err) = queue.complete(queued.id).await {
                        error!(error = %err, "could not complete job");
                    }
                }
                Err(err) => {
                    warn!(
                        rule = %job.rule_name,
                        key = %job.idempotency_key,
                        attempt = queued.attempt,
                        error = %err,
                        "produce attempt failed"
                    );
                    if let Err(err) = queue
                        .fail(queued.id, &err.to_string(), config.bridge.max_produce_retries)
                        .await
                    {
                        error!(error = %err, "could not record job failure");
                    }
                }
            }
        }
    }
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
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone()));
    let documents: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
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
    let sink = Arc::new(KafkaSink::new(&config.bridge.kafka).context("creating kafka producer")?);

    sink.probe().context("reaching kafka brokers")?;
    registry
        .list_subjects()
        .await
        .context("reaching schema registry")?;

    let rules = Arc::new(
        RuleSet::new(load_rules(&config.bridge.rules_path)?).context("loading emission rules")?,
    );
    let pipeline = Arc::new(ProducerPipeline::new(
        audit.clone(),
        schemas.clone(),
        codec,
        sink,
        MethodRegistry::new(),
        config.bridge.source_name.clone(),
        config.bridge.command_topic.clone(),
        config.bridge.default_tenant_id.clone(),
        config.bridge.log_payload_on_success,
    ));

    let liveness = HealthRegistry::new();
    let worker_health = liveness.register("worker", Duration::from_secs(30));
    start_liveness_server(&config, liveness);

    let sweeper = Sweeper::new(
        audit,
        queue.clone(),
        config.bridge.stale_pending_after_secs,
        config.bridge.max_produce_retries,
        config.bridge.log_retention_days,
    );
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    tokio::task::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            if let Err(err) = sweeper.sweep().await {
                error!(error = %err, "audit sweep failed");
            }
        }
    });

    let refresh_interval = Duration::from_secs(config.schema_refresh_interval_secs);
    let refresh_schemas = schemas.clone();
    tokio::task::spawn(async move {
        loop {
            tokio::time::sleep(refresh_interval).await;
            match refresh_schemas.refresh().await {
                Ok(count) => info!(count, "schema refresh sweep finished"),
                Err(err) => error!(error = %err, "schema refresh sweep failed"),
            }
        }
    });

    info!("bridge worker starting");
    worker_loop(config, queue, documents, rules, pipeline, worker_health).await;
    Ok(())
}
