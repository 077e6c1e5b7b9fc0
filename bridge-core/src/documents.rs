//! Port onto the host application's document layer.
//!
//! The bridge reads the documents that trigger production and writes the
//! documents that inbound actions create or update. It never owns business
//! records; `PgDocumentStore` is a jsonb-backed adapter for deployments
//! where the host exposes its records through a shared table, and anything
//! else plugs in behind the trait.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::types::Document;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Document>, BridgeError>;

    async fn create(
        &self,
        entity_type: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<Document, BridgeError>;

    /// Find the single document where `field == value`.
    async fn find_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Option<Document>, BridgeError>;

    /// Merge `fields` into an existing document.
    async fn update(
        &self,
        entity_type: &str,
        id: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<(), BridgeError>;
}

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Document>, BridgeError> {
        let row: Option<(JsonValue,)> = sqlx::query_as(
            "SELECT fields FROM bridge_documents WHERE entity_type = $1 AND entity_id = $2",
        )
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(fields,)| Document {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            fields: as_object(fields),
        }))
    }

    async fn create(
        &self,
        entity_type: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<Document, BridgeError> {
        let id = Uuid::now_v7().to_string();
        sqlx::query(
            r#"
INSERT INTO bridge_documents (entity_type, entity_id, fields, created_at, updated_at)
VALUES ($1, $2, $3, now(), now())
"#,
        )
        .bind(entity_type)
        .bind(&id)
        .bind(JsonValue::Object(fields.clone()))
        .execute(&self.pool)
        .await?;

        Ok(Document {
            entity_type: entity_type.to_string(),
            id,
            fields,
        })
    }

    async fn find_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Option<Document>, BridgeError> {
        let row: Option<(String, JsonValue)> = sqlx::query_as(
            r#"
SELECT entity_id, fields FROM bridge_documents
WHERE entity_type = $1 AND fields -> $2 = $3
LIMIT 1
"#,
        )
        .bind(entity_type)
        .bind(field)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, fields)| Document {
            entity_type: entity_type.to_string(),
            id,
            fields: as_object(fields),
        }))
    }

    async fn update(
        &self,
        entity_type: &str,
        id: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<(), BridgeError> {
        let result = sqlx::query(
            r#"
UPDATE bridge_documents
SET fields = fields || $3, updated_at = now()
WHERE entity_type = $1 AND entity_id = $2
"#,
        )
        .bind(entity_type)
        .bind(id)
        .bind(JsonValue::Object(fields))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound {
                entity: entity_type.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn as_object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}
