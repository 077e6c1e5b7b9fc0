//! Best-effort correlation of produced and consumed audit rows.
//!
//! When both sides of a conversation reference the same business key, the
//! newest row in each direction gets a back-reference to the other. This
//! is enrichment only; it runs after the main paths finish and a failure
//! here never fails a produce or consume.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::audit::{AuditStore, Direction};
use crate::error::BridgeError;

pub struct CorrelationService {
    audit: Arc<dyn AuditStore>,
}

impl CorrelationService {
    pub fn new(audit: Arc<dyn AuditStore>) -> Self {
        Self { audit }
    }

    /// Link the newest Produced and Consumed rows sharing `business_key`.
    /// Returns whether a pair was found and linked.
    pub async fn correlate(&self, business_key: &str) -> Result<bool, BridgeError> {
        let produced = self
            .audit
            .latest_for_business_key(Direction::Produced, business_key)
            .await?;
        let consumed = self
            .audit
            .latest_for_business_key(Direction::Consumed, business_key)
            .await?;

        match (produced, consumed) {
            (Some(produced), Some(consumed)) => {
                self.audit.set_correlated(produced.id, consumed.id).await?;
                self.audit.set_correlated(consumed.id, produced.id).await?;
                debug!(
                    business_key,
                    produced = %produced.id,
                    consumed = %consumed.id,
                    "audit rows correlated"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Same as [`correlate`](Self::correlate) but swallows errors, for use
    /// on the hot paths.
    pub async fn correlate_best_effort(&self, business_key: &str) {
        if let Err(err) = self.correlate(business_key).await {
            warn!(business_key, error = %err, "correlation failed");
        }
    }
}
