//! Message audit log: one row per production or consumption attempt.
//!
//! The log is the source of truth for idempotent delivery. Every attempt
//! creates a `Pending` row and finishes it with exactly one forward
//! transition; the dedup checks in the producer pipeline and consumer loop
//! query it for a prior terminal-success status before doing any work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "log_direction", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Produced,
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "log_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Delivered,
    Processed,
    Failed,
    DeadLetter,
    Skipped,
}

impl LogStatus {
    /// Statuses that count as "this key is done" for dedup purposes.
    pub const TERMINAL_SUCCESS: [LogStatus; 3] =
        [LogStatus::Delivered, LogStatus::Processed, LogStatus::Skipped];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LogStatus::Pending)
    }

    /// Transitions only move forward: `Pending` can reach any terminal
    /// status, terminal statuses reach nothing.
    pub fn can_transition_to(&self, next: LogStatus) -> bool {
        matches!(self, LogStatus::Pending) && next != LogStatus::Pending
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: Uuid,
    pub direction: Direction,
    pub status: LogStatus,
    pub idempotency_key: String,
    pub topic: String,
    pub kafka_partition: Option<i32>,
    pub kafka_offset: Option<i64>,
    pub tenant_id: String,
    pub event_type: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub rule_name: Option<String>,
    pub handler_name: Option<String>,
    pub business_key: Option<String>,
    pub payload: Option<JsonValue>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub correlated_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields known when an attempt starts. Everything else is filled in as the
/// attempt progresses.
#[derive(Debug, Clone, Default)]
pub struct NewMessageLog {
    pub idempotency_key: String,
    pub topic: String,
    pub tenant_id: String,
    pub event_type: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub rule_name: Option<String>,
    pub kafka_partition: Option<i32>,
    pub kafka_offset: Option<i64>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a `Pending` row for a new attempt. `retry_count` is the number
    /// of prior attempts recorded for the same key and direction.
    async fn create(
        &self,
        direction: Direction,
        entry: NewMessageLog,
    ) -> Result<MessageLog, BridgeError>;

    /// True when a terminal-success row (`Delivered`, `Processed` or
    /// `Skipped`) already exists for this key.
    async fn already_completed(&self, idempotency_key: &str) -> Result<bool, BridgeError>;

    async fn mark_delivered(
        &self,
        id: Uuid,
        partition: i32,
        offset: i64,
    ) -> Result<(), BridgeError>;
    async fn mark_processed(&self, id: Uuid) -> Result<(), BridgeError>;
    async fn mark_skipped(&self, id: Uuid, reason: &str) -> Result<(), BridgeError>;
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), BridgeError>;
    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), BridgeError>;

    async fn set_payload(&self, id: Uuid, payload: &JsonValue) -> Result<(), BridgeError>;
    async fn set_handler(&self, id: Uuid, handler_name: &str) -> Result<(), BridgeError>;
    async fn set_business_key(&self, id: Uuid, business_key: &str) -> Result<(), BridgeError>;
    async fn set_correlated(&self, id: Uuid, other: Uuid) -> Result<(), BridgeError>;

    /// Newest row in `direction` tagged with this business key.
    async fn latest_for_business_key(
        &self,
        direction: Direction,
        business_key: &str,
    ) -> Result<Option<MessageLog>, BridgeError>;

    /// Rows still `Pending` whose attempt started before `cutoff`.
    async fn list_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MessageLog>, BridgeError>;

    /// Delete terminal rows last touched before `cutoff`. Returns how many.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BridgeError>;
}

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Guarded update: only fires when the current status may move to
    /// `next`. A no-op update means another writer got there first, which
    /// is logged but not an error.
    async fn transition(
        &self,
        id: Uuid,
        next: LogStatus,
        error: Option<&str>,
        bump_retry: bool,
    ) -> Result<(), BridgeError> {
        let result = sqlx::query(
            r#"
UPDATE bridge_message_log
SET status = $2,
    error_message = COALESCE($3, error_message),
    retry_count = retry_count + $4,
    updated_at = now()
WHERE id = $1 AND status = 'pending'
"#,
        )
        .bind(id)
        .bind(next)
        .bind(error)
        .bind(if bump_retry { 1i32 } else { 0i32 })
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(log_id = %id, next = ?next, "status transition skipped, row is not pending");
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn create(
        &self,
        direction: Direction,
        entry: NewMessageLog,
    ) -> Result<MessageLog, BridgeError> {
        let row = sqlx::query_as::<_, MessageLog>(
            r#"
INSERT INTO bridge_message_log
    (id, direction, status, idempotency_key, topic, kafka_partition, kafka_offset,
     tenant_id, event_type, entity_type, entity_id, rule_name, retry_count,
     created_at, updated_at)
VALUES
    ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, $9, $10, $11,
     (SELECT count(*)::int FROM bridge_message_log
      WHERE idempotency_key = $3 AND direction = $2),
     now(), now())
RETURNING *
"#,
        )
        .bind(Uuid::now_v7())
        .bind(direction)
        .bind(&entry.idempotency_key)
        .bind(&entry.topic)
        .bind(entry.kafka_partition)
        .bind(entry.kafka_offset)
        .bind(&entry.tenant_id)
        .bind(&entry.event_type)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.rule_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn already_completed(&self, idempotency_key: &str) -> Result<bool, BridgeError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
SELECT EXISTS (
    SELECT 1 FROM bridge_message_log
    WHERE idempotency_key = $1
      AND status IN ('delivered', 'processed', 'skipped')
)
"#,
        )
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        partition: i32,
        offset: i64,
    ) -> Result<(), BridgeError> {
        let result = sqlx::query(
            r#"
UPDATE bridge_message_log
SET status = 'delivered', kafka_partition = $2, kafka_offset = $3, updated_at = now()
WHERE id = $1 AND status = 'pending'
"#,
        )
        .bind(id)
        .bind(partition)
        .bind(offset)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(log_id = %id, "delivered transition skipped, row is not pending");
        }
        Ok(())
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), BridgeError> {
        self.transition(id, LogStatus::Processed, None, false).await
    }

    async fn mark_skipped(&self, id: Uuid, reason: &str) -> Result<(), BridgeError> {
        self.transition(id, LogStatus::Skipped, Some(reason), false)
            .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), BridgeError> {
        self.transition(id, LogStatus::Failed, Some(error), true)
            .await
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), BridgeError> {
        self.transition(id, LogStatus::DeadLetter, Some(error), false)
            .await
    }

    async fn set_payload(&self, id: Uuid, payload: &JsonValue) -> Result<(), BridgeError> {
        sqlx::query(
            "UPDATE bridge_message_log SET payload = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_handler(&self, id: Uuid, handler_name: &str) -> Result<(), BridgeError> {
        sqlx::query(
            "UPDATE bridge_message_log SET handler_name = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(handler_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_business_key(&self, id: Uuid, business_key: &str) -> Result<(), BridgeError> {
        sqlx::query(
            "UPDATE bridge_message_log SET business_key = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(business_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_correlated(&self, id: Uuid, other: Uuid) -> Result<(), BridgeError> {
        sqlx::query(
            "UPDATE bridge_message_log SET correlated_id = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(other)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_for_business_key(
        &self,
        direction: Direction,
        business_key: &str,
    ) -> Result<Option<MessageLog>, BridgeError> {
        let row = sqlx::query_as::<_, MessageLog>(
            r#"
SELECT * FROM bridge_message_log
WHERE direction = $1 AND business_key = $2
ORDER BY created_at DESC
LIMIT 1
"#,
        )
        .bind(direction)
        .bind(business_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MessageLog>, BridgeError> {
        let rows = sqlx::query_as::<_, MessageLog>(
            r#"
SELECT * FROM bridge_message_log
WHERE status = 'pending' AND created_at < $1
ORDER BY created_at
"#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BridgeError> {
        let result = sqlx::query(
            r#"
DELETE FROM bridge_message_log
WHERE status <> 'pending' AND updated_at < $1
"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
