//! Three-tier schema resolution.
//!
//! Lookup order: in-process TTL cache, then the persistent schema table,
//! then the authoritative registry. A registry hit writes through the lower
//! tiers so the next resolve is local. Invalidation only ever touches
//! tier 1; the table stays the durable record and the registry stays
//! authoritative.

use std::sync::Arc;
use std::time::Duration;

use apache_avro::Schema;
use async_trait::async_trait;
use metrics::counter;
use moka::sync::Cache;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::metrics_consts::{
    SCHEMA_CACHE_HITS, SCHEMA_CACHE_MISSES, SCHEMA_REGISTRY_FETCHES,
};
use crate::registry::SchemaRegistry;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSchema {
    pub name: String,
    pub version: i32,
    pub body: String,
}

/// Tier 2: persistent store keyed by schema name, one latest row per name.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn get_latest(&self, name: &str) -> Result<Option<StoredSchema>, BridgeError>;

    /// Store a new latest version, clearing the previous latest flag in the
    /// same transaction so at most one row per name carries it.
    async fn put_latest(&self, name: &str, version: i32, body: &str) -> Result<(), BridgeError>;

    async fn list_latest_names(&self) -> Result<Vec<String>, BridgeError>;
}

pub struct SchemaCache {
    tier1: Cache<String, Arc<Schema>>,
    store: Arc<dyn SchemaStore>,
    registry: Arc<dyn SchemaRegistry>,
}

impl SchemaCache {
    pub fn new(
        ttl: Duration,
        store: Arc<dyn SchemaStore>,
        registry: Arc<dyn SchemaRegistry>,
    ) -> Self {
        Self {
            tier1: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            store,
            registry,
        }
    }

    /// Resolve a parsed schema by name, failing with `SchemaNotFound` only
    /// when all three tiers miss.
    pub async fn resolve(&self, name: &str) -> Result<Arc<Schema>, BridgeError> {
        if let Some(schema) = self.tier1.get(name) {
            counter!(SCHEMA_CACHE_HITS, "tier" => "memory").increment(1);
            return Ok(schema);
        }
        counter!(SCHEMA_CACHE_MISSES).increment(1);

        if let Some(stored) = self.store.get_latest(name).await? {
            counter!(SCHEMA_CACHE_HITS, "tier" => "store").increment(1);
            let schema = Arc::new(Schema::parse_str(&stored.body)?);
            self.tier1.insert(name.to_string(), schema.clone());
            return Ok(schema);
        }

        counter!(SCHEMA_REGISTRY_FETCHES).increment(1);
        let registered = match self.registry.get_latest(name).await {
            Ok(registered) => registered,
            Err(err) => {
                warn!(schema = name, error = %err, "all schema tiers missed");
                return Err(BridgeError::SchemaNotFound(name.to_string()));
            }
        };
        let schema = Arc::new(Schema::parse_str(&registered.schema)?);
        self.store
            .put_latest(name, registered.version, &registered.schema)
            .await?;
        self.tier1.insert(name.to_string(), schema.clone());
        debug!(schema = name, version = registered.version, "schema fetched from registry");
        Ok(schema)
    }

    /// Drop entries from the in-process tier only.
    pub fn invalidate(&self, name: Option<&str>) {
        match name {
            Some(name) => self.tier1.invalidate(name),
            None => self.tier1.invalidate_all(),
        }
    }

    /// Re-fetch every known latest schema from the registry into tier 1.
    /// Each schema is refreshed independently; a failing fetch is logged
    /// and the sweep moves on.
    pub async fn refresh(&self) -> Result<usize, BridgeError> {
        let names = self.store.list_latest_names().await?;
        let mut refreshed = 0;
        for name in names {
            match self.registry.get_latest(&name).await {
                Ok(registered) => match Schema::parse_str(&registered.schema) {
                    Ok(schema) => {
                        self.tier1.insert(name, Arc::new(schema));
                        refreshed += 1;
                    }
                    Err(err) => warn!(schema = %name, error = %err, "refresh skipped unparseable schema"),
                },
                Err(err) => warn!(schema = %name, error = %err, "refresh fetch failed"),
            }
        }
        Ok(refreshed)
    }
}

pub struct PgSchemaStore {
    pool: PgPool,
}

impl PgSchemaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaStore for PgSchemaStore {
    async fn get_latest(&self, name: &str) -> Result<Option<StoredSchema>, BridgeError> {
        let row = sqlx::query_as::<_, StoredSchema>(
            "SELECT name, version, body FROM bridge_avro_schema WHERE name = $1 AND is_latest",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put_latest(&self, name: &str, version: i32, body: &str) -> Result<(), BridgeError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE bridge_avro_schema SET is_latest = false WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
INSERT INTO bridge_avro_schema (name, version, body, is_latest, created_at)
VALUES ($1, $2, $3, true, now())
ON CONFLICT (name, version)
DO UPDATE SET body = EXCLUDED.body, is_latest = true
"#,
        )
        .bind(name)
        .bind(version)
        .bind(body)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_latest_names(&self) -> Result<Vec<String>, BridgeError> {
        let names: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM bridge_avro_schema WHERE is_latest ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(names.into_iter().map(|(name,)| name).collect())
    }
}
