//! Periodic housekeeping over the audit log and the job queue.
//!
//! A worker that dies between `dequeue` and `complete` strands its job at
//! `running`; the sweep makes such jobs available again once their lock has
//! aged past the staleness window. A produce attempt that dies between its
//! `Pending` audit row and a terminal status leaves that row stuck too: the
//! sweep fails such rows and, while attempts remain, re-enqueues a produce
//! job for the same key; the dedup check lets the retry through because
//! `Failed` is not a terminal success. Terminal rows past the retention
//! window are deleted.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use tracing::{info, warn};

use crate::audit::{AuditStore, Direction};
use crate::error::BridgeError;
use crate::jobs::{JobQueue, ProduceJob};
use crate::metrics_consts::{JOBS_RECLAIMED, STALE_PENDING_SWEPT};

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub requeued: usize,
    pub failed: usize,
    pub purged: u64,
}

pub struct Sweeper {
    audit: Arc<dyn AuditStore>,
    jobs: Arc<dyn JobQueue>,
    stale_after_secs: u64,
    max_produce_retries: i32,
    retention_days: i64,
}

impl Sweeper {
    pub fn new(
        audit: Arc<dyn AuditStore>,
        jobs: Arc<dyn JobQueue>,
        stale_after_secs: u64,
        max_produce_retries: i32,
        retention_days: i64,
    ) -> Self {
        Self {
            audit,
            jobs,
            stale_after_secs,
            max_produce_retries,
            retention_days,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, BridgeError> {
        let now = Utc::now();
        let stale_cutoff = now - ChronoDuration::seconds(self.stale_after_secs as i64);
        let mut report = SweepReport::default();

        // Reclaim before requeueing: a crashed worker's `running` row still
        // holds its idempotency key, so its trigger can only ever run again
        // by making that same row available.
        report.reclaimed = self.jobs.reclaim_stuck(stale_cutoff).await?;
        if report.reclaimed > 0 {
            counter!(JOBS_RECLAIMED).increment(report.reclaimed);
        }

        for row in self.audit.list_stale_pending(stale_cutoff).await? {
            let requeueable = row.direction == Direction::Produced
                && row.retry_count < self.max_produce_retries
                && row.entity_type.is_some()
                && row.entity_id.is_some()
                && row.rule_name.is_some();

            self.audit
                .mark_failed(row.id, "stale pending attempt swept")
                .await?;
            counter!(STALE_PENDING_SWEPT).increment(1);

            if requeueable {
                let job = ProduceJob {
                    entity_type: row.entity_type.clone().unwrap_or_default(),
                    entity_id: row.entity_id.clone().unwrap_or_default(),
                    rule_name: row.rule_name.clone().unwrap_or_default(),
                    idempotency_key: row.idempotency_key.clone(),
                };
                match self.jobs.enqueue(&job).await {
                    Ok(true) => report.requeued += 1,
                    // A row with this key is already queued, either freshly
                    // enqueued or reclaimed above. The retry rides on it.
                    Ok(false) => {
                        warn!(key = %row.idempotency_key, "requeue found the job already queued")
                    }
                    Err(err) => {
                        warn!(key = %row.idempotency_key, error = %err, "requeue failed");
                        report.failed += 1;
                    }
                }
            } else {
                report.failed += 1;
            }
        }

        let retention_cutoff = now - ChronoDuration::days(self.retention_days);
        report.purged = self.audit.purge_terminal_before(retention_cutoff).await?;

        info!(
            reclaimed = report.reclaimed,
            requeued = report.requeued,
            failed = report.failed,
            purged = report.purged,
            "audit sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{LogStatus, NewMessageLog};
    use crate::test_utils::{InMemoryAuditStore, InMemoryJobQueue};

    fn pending_produced(key: &str) -> NewMessageLog {
        NewMessageLog {
            idempotency_key: key.to_string(),
            topic: "fineract.commands".to_string(),
            tenant_id: "default".to_string(),
            event_type: Some("CreateClient".to_string()),
            entity_type: Some("Customer".to_string()),
            entity_id: Some("CUST-0001".to_string()),
            rule_name: Some("create".to_string()),
            ..NewMessageLog::default()
        }
    }

    fn sweeper(
        audit: Arc<InMemoryAuditStore>,
        jobs: Arc<InMemoryJobQueue>,
    ) -> Sweeper {
        // Zero staleness so freshly created rows count as stale in tests.
        Sweeper::new(audit, jobs, 0, 3, 30)
    }

    #[tokio::test]
    async fn stale_pending_produced_rows_are_failed_and_requeued() {
        let audit = Arc::new(InMemoryAuditStore::default());
        let jobs = Arc::new(InMemoryJobQueue::default());
        audit
            .create(Direction::Produced, pending_produced("key-1"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let report = sweeper(audit.clone(), jobs.clone()).sweep().await.unwrap();
        assert_eq!(report.requeued, 1);

        let row = audit.latest().unwrap();
        assert_eq!(row.status, LogStatus::Failed);
        assert_eq!(jobs.jobs()[0].idempotency_key, "key-1");
        assert_eq!(jobs.jobs()[0].rule_name, "create");
    }

    #[tokio::test]
    async fn jobs_stranded_by_a_crashed_worker_become_available_again() {
        let audit = Arc::new(InMemoryAuditStore::default());
        let jobs = Arc::new(InMemoryJobQueue::default());
        jobs.enqueue(&ProduceJob {
            entity_type: "Customer".to_string(),
            entity_id: "CUST-0001".to_string(),
            rule_name: "create".to_string(),
            idempotency_key: "key-1".to_string(),
        })
        .await
        .unwrap();
        // The worker claims the job and dies before completing or failing
        // it, leaving a running row that still owns the idempotency key.
        assert_eq!(jobs.dequeue(10).await.unwrap().len(), 1);
        audit
            .create(Direction::Produced, pending_produced("key-1"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let report = sweeper(audit, jobs.clone()).sweep().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        // The requeue collides with the reclaimed row; the retry rides on it.
        assert_eq!(report.requeued, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(jobs.available().len(), 1);

        let retried = jobs.dequeue(10).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].idempotency_key, "key-1");
    }

    #[tokio::test]
    async fn requeue_against_an_already_queued_key_is_not_counted() {
        let audit = Arc::new(InMemoryAuditStore::default());
        let jobs = Arc::new(InMemoryJobQueue::default());
        jobs.enqueue(&ProduceJob {
            entity_type: "Customer".to_string(),
            entity_id: "CUST-0001".to_string(),
            rule_name: "create".to_string(),
            idempotency_key: "key-1".to_string(),
        })
        .await
        .unwrap();
        audit
            .create(Direction::Produced, pending_produced("key-1"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let report = sweeper(audit, jobs.clone()).sweep().await.unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(jobs.jobs().len(), 1);
    }

    #[tokio::test]
    async fn rows_out_of_retries_fail_without_requeue() {
        let audit = Arc::new(InMemoryAuditStore::default());
        let jobs = Arc::new(InMemoryJobQueue::default());
        // Three prior attempts exist, so the stale row's retry_count is at
        // the limit.
        for _ in 0..3 {
            let row = audit
                .create(Direction::Produced, pending_produced("key-1"))
                .await
                .unwrap();
            audit.mark_failed(row.id, "boom").await.unwrap();
        }
        audit
            .create(Direction::Produced, pending_produced("key-1"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let report = sweeper(audit, jobs.clone()).sweep().await.unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.failed, 1);
        assert!(jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn consumed_rows_are_never_requeued() {
        let audit = Arc::new(InMemoryAuditStore::default());
        let jobs = Arc::new(InMemoryJobQueue::default());
        audit
            .create(
                Direction::Consumed,
                NewMessageLog {
                    idempotency_key: "evt-1".to_string(),
                    topic: "fineract.events".to_string(),
                    tenant_id: "default".to_string(),
                    ..NewMessageLog::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let report = sweeper(audit.clone(), jobs.clone()).sweep().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(jobs.jobs().is_empty());
        assert_eq!(audit.latest().unwrap().status, LogStatus::Failed);
    }
}
