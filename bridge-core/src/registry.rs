//! Schema registry port and its Confluent REST implementation.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredSchema {
    pub id: i32,
    pub version: i32,
    pub schema: String,
}

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn get_latest(&self, subject: &str) -> Result<RegisteredSchema, BridgeError>;
    async fn register(&self, subject: &str, schema: &str) -> Result<i32, BridgeError>;
    async fn get_by_id(&self, id: i32) -> Result<String, BridgeError>;
    /// Used by the health surface only.
    async fn list_subjects(&self) -> Result<Vec<String>, BridgeError>;
}

pub struct RestSchemaRegistry {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SubjectVersionResponse {
    id: i32,
    version: i32,
    schema: String,
}

#[derive(Deserialize)]
struct SchemaByIdResponse {
    schema: String,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: i32,
}

impl RestSchemaRegistry {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl SchemaRegistry for RestSchemaRegistry {
    async fn get_latest(&self, subject: &str) -> Result<RegisteredSchema, BridgeError> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::SchemaNotFound(subject.to_string()));
        }
        let body: SubjectVersionResponse = response.error_for_status()?.json().await?;
        debug!(subject, id = body.id, version = body.version, "registry returned latest schema");
        Ok(RegisteredSchema {
            id: body.id,
            version: body.version,
            schema: body.schema,
        })
    }

    async fn register(&self, subject: &str, schema: &str) -> Result<i32, BridgeError> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        let body: RegisterResponse = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "schema": schema }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.id)
    }

    async fn get_by_id(&self, id: i32) -> Result<String, BridgeError> {
        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::SchemaNotFound(format!("id {id}")));
        }
        let body: SchemaByIdResponse = response.error_for_status()?.json().await?;
        Ok(body.schema)
    }

    async fn list_subjects(&self) -> Result<Vec<String>, BridgeError> {
        let url = format!("{}/subjects", self.base_url);
        let subjects = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_latest_version_for_a_subject() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/subjects/ClientCreateCommand/versions/latest")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"subject":"ClientCreateCommand","id":7,"version":3,"schema":"{\"type\":\"string\"}"}"#,
            )
            .create_async()
            .await;

        let registry = RestSchemaRegistry::new(&server.url(), reqwest::Client::new());
        let latest = registry.get_latest("ClientCreateCommand").await.unwrap();
        assert_eq!(latest.id, 7);
        assert_eq!(latest.version, 3);
        assert_eq!(latest.schema, r#"{"type":"string"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_subject_maps_to_schema_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subjects/Nope/versions/latest")
            .with_status(404)
            .with_body(r#"{"error_code":40401,"message":"Subject not found."}"#)
            .create_async()
            .await;

        let registry = RestSchemaRegistry::new(&server.url(), reqwest::Client::new());
        let err = registry.get_latest("Nope").await.unwrap_err();
        assert!(matches!(err, BridgeError::SchemaNotFound(_)));
    }

    #[tokio::test]
    async fn registers_a_schema_and_returns_its_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/subjects/org.apache.fineract.avro.MessageV1/versions")
            .with_status(200)
            .with_body(r#"{"id":12}"#)
            .create_async()
            .await;

        let registry = RestSchemaRegistry::new(&server.url(), reqwest::Client::new());
        let id = registry
            .register("org.apache.fineract.avro.MessageV1", r#"{"type":"string"}"#)
            .await
            .unwrap();
        assert_eq!(id, 12);
        mock.assert_async().await;
    }
}
