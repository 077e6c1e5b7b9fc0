//! Deferred job plumbing.
//!
//! Outbound production never runs inside the triggering transaction: rule
//! matching enqueues one `ProduceJob` per passing rule, deduplicated on the
//! idempotency key, and worker processes pull them with `FOR UPDATE SKIP
//! LOCKED` so concurrent workers own disjoint jobs. Inbound actions go the
//! other way through [`JobSubmitter`], a thin port onto whatever background
//! job system the host application runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BridgeError;

/// One deferred production attempt for one matched rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceJob {
    pub entity_type: String,
    pub entity_id: String,
    pub rule_name: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedProduceJob {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub rule_name: String,
    pub idempotency_key: String,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
}

impl QueuedProduceJob {
    pub fn job(&self) -> ProduceJob {
        ProduceJob {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            rule_name: self.rule_name.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a produce job, deduplicated on its idempotency key. Returns
    /// false when an identical pending job already exists.
    async fn enqueue(&self, job: &ProduceJob) -> Result<bool, BridgeError>;

    /// Claim up to `limit` available jobs for this worker.
    async fn dequeue(&self, limit: i64) -> Result<Vec<QueuedProduceJob>, BridgeError>;

    async fn complete(&self, id: Uuid) -> Result<(), BridgeError>;

    /// Record a failed attempt. The job becomes available again until
    /// `max_attempts` is reached, after which it stays parked with its error.
    async fn fail(&self, id: Uuid, error: &str, max_attempts: i32) -> Result<(), BridgeError>;

    /// Make running jobs whose worker died available again. A crash between
    /// `dequeue` and `complete`/`fail` leaves the row locked, and the row
    /// still holds its idempotency key, so a fresh `enqueue` for the same
    /// trigger would collide and no-op. Returns how many jobs were reclaimed.
    async fn reclaim_stuck(&self, locked_before: DateTime<Utc>) -> Result<u64, BridgeError>;
}

/// Port onto the host application's background job system, used by inbound
/// action dispatch. Context payloads are JSON; binary envelope data is
/// stripped before submission to bound job size.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(
        &self,
        job_name: &str,
        queue: &str,
        context: JsonValue,
    ) -> Result<(), BridgeError>;
}

pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: &ProduceJob) -> Result<bool, BridgeError> {
        let result = sqlx::query(
            r#"
INSERT INTO bridge_produce_jobs
    (id, entity_type, entity_id, rule_name, idempotency_key, created_at)
VALUES ($1, $2, $3, $4, $5, now())
ON CONFLICT (idempotency_key) DO NOTHING
"#,
        )
        .bind(Uuid::now_v7())
        .bind(&job.entity_type)
        .bind(&job.entity_id)
        .bind(&job.rule_name)
        .bind(&job.idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dequeue(&self, limit: i64) -> Result<Vec<QueuedProduceJob>, BridgeError> {
        let jobs = sqlx::query_as::<_, QueuedProduceJob>(
            r#"
UPDATE bridge_produce_jobs
SET status = 'running', attempt = attempt + 1, locked_at = now()
WHERE id IN (
    SELECT id FROM bridge_produce_jobs
    WHERE status = 'available'
    ORDER BY created_at
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
RETURNING id, entity_type, entity_id, rule_name, idempotency_key, attempt, created_at
"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn complete(&self, id: Uuid) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM bridge_produce_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str, max_attempts: i32) -> Result<(), BridgeError> {
        sqlx::query(
            r#"
UPDATE bridge_produce_jobs
SET status = CASE WHEN attempt >= $3 THEN 'failed' ELSE 'available' END,
    last_error = $2,
    locked_at = NULL
WHERE id = $1
"#,
        )
        .bind(id)
        .bind(error)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reclaim_stuck(&self, locked_before: DateTime<Utc>) -> Result<u64, BridgeError> {
        let result = sqlx::query(
            r#"
UPDATE bridge_produce_jobs
SET status = 'available', locked_at = NULL
WHERE status = 'running' AND locked_at < $1
"#,
        )
        .bind(locked_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Submits host-application jobs onto a Postgres table the host polls. The
/// real deployment plugs its own implementation in; this keeps dispatched
/// actions durable without reaching into the host's internals.
pub struct PgJobSubmitter {
    pool: PgPool,
}

impl PgJobSubmitter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobSubmitter for PgJobSubmitter {
    async fn submit(
        &self,
        job_name: &str,
        queue: &str,
        context: JsonValue,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            r#"
INSERT INTO bridge_action_jobs (id, job_name, queue, context, created_at)
VALUES ($1, $2, $3, $4, now())
"#,
        )
        .bind(Uuid::now_v7())
        .bind(job_name)
        .bind(queue)
        .bind(&context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
