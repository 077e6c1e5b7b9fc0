//! Outbound rule matching.
//!
//! A document event fans out to zero or more deferred produce jobs, one per
//! matching enabled rule whose guard passes. Guards run in the expression
//! sandbox with only the triggering document bound; a guard that errors
//! skips its own rule and never takes its siblings down. The caller invokes
//! [`schedule_document_event`] after the triggering transaction commits, so
//! nothing is ever produced for a rolled-back mutation.

use metrics::counter;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::expr::{self, Scope};
use crate::idempotency;
use crate::jobs::{JobQueue, ProduceJob};
use crate::metrics_consts::JOBS_ENQUEUED;
use crate::types::{DocEvent, Document, EmissionRule};

/// Validated, immutable set of emission rules for the process lifetime.
pub struct RuleSet {
    rules: Vec<EmissionRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<EmissionRule>) -> Result<Self, BridgeError> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    pub fn get(&self, name: &str) -> Option<&EmissionRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    pub fn has_rules_for(&self, entity_type: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.enabled && rule.entity_type == entity_type)
    }

    /// Enabled rules matching the entity type and event, ascending priority.
    /// The sort is stable so equal priorities keep declaration order.
    pub fn match_rules(&self, entity_type: &str, event: DocEvent) -> Vec<&EmissionRule> {
        let mut matched: Vec<&EmissionRule> = self
            .rules
            .iter()
            .filter(|rule| {
                rule.enabled && rule.entity_type == entity_type && rule.event == event
            })
            .collect();
        matched.sort_by_key(|rule| rule.priority);
        matched
    }
}

fn guard_passes(rule: &EmissionRule, doc: &Document) -> bool {
    let Some(condition) = &rule.condition else {
        return true;
    };
    let scope = Scope::new().bind("doc", doc.as_json());
    match expr::eval_bool(condition, &scope) {
        Ok(passed) => passed,
        Err(err) => {
            warn!(rule = %rule.name, error = %err, "rule guard failed to evaluate, skipping rule");
            false
        }
    }
}

/// Entry point for a committed document event: match rules, evaluate
/// guards, and enqueue one deduplicated produce job per passing rule.
/// Returns how many jobs were newly enqueued.
pub async fn schedule_document_event(
    rules: &RuleSet,
    queue: &dyn JobQueue,
    doc: &Document,
    host_event: &str,
) -> Result<usize, BridgeError> {
    let Some(event) = DocEvent::from_host_event(host_event) else {
        return Ok(0);
    };
    if !rules.has_rules_for(&doc.entity_type) {
        return Ok(0);
    }

    let mut enqueued = 0;
    for rule in rules.match_rules(&doc.entity_type, event) {
        if !guard_passes(rule, doc) {
            continue;
        }
        let key = idempotency::producer_key(
            &doc.entity_type,
            &doc.id,
            event.as_str(),
            &rule.command_type,
            &rule.name,
        )?;
        let fresh = queue
            .enqueue(&ProduceJob {
                entity_type: doc.entity_type.clone(),
                entity_id: doc.id.clone(),
                rule_name: rule.name.clone(),
                idempotency_key: key,
            })
            .await?;
        if fresh {
            counter!(JOBS_ENQUEUED).increment(1);
            enqueued += 1;
        } else {
            debug!(rule = %rule.name, doc = %doc.id, "produce job already queued");
        }
    }
    Ok(enqueued)
}

/// Host-facing manual re-trigger for one rule on one document. Deliberate
/// replays bypass the guard and carry a salted key, so a prior delivery of
/// the same trigger never suppresses them.
pub async fn retrigger_rule(
    rules: &RuleSet,
    queue: &dyn JobQueue,
    doc: &Document,
    rule_name: &str,
) -> Result<(), BridgeError> {
    let rule = rules.get(rule_name).ok_or_else(|| {
        BridgeError::InvalidArgument(format!("no emission rule named {rule_name:?}"))
    })?;
    let key = idempotency::retrigger_key(
        &doc.entity_type,
        &doc.id,
        rule.event.as_str(),
        &rule.command_type,
        &rule.name,
    )?;
    queue
        .enqueue(&ProduceJob {
            entity_type: doc.entity_type.clone(),
            entity_id: doc.id.clone(),
            rule_name: rule.name.clone(),
            idempotency_key: key,
        })
        .await?;
    counter!(JOBS_ENQUEUED).increment(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{customer_doc, rule_named, InMemoryJobQueue};

    fn rule_for(name: &str, event: DocEvent, priority: i32) -> EmissionRule {
        let mut rule = rule_named(name);
        rule.event = event;
        rule.priority = priority;
        rule
    }

    #[test]
    fn matching_filters_on_entity_event_and_enabled() {
        let mut disabled = rule_for("disabled", DocEvent::AfterInsert, 0);
        disabled.enabled = false;
        let mut other_entity = rule_for("loan", DocEvent::AfterInsert, 0);
        other_entity.entity_type = "Loan".to_string();

        let rules = RuleSet::new(vec![
            rule_for("create", DocEvent::AfterInsert, 0),
            rule_for("update", DocEvent::OnUpdate, 0),
            disabled,
            other_entity,
        ])
        .unwrap();

        let matched = rules.match_rules("Customer", DocEvent::AfterInsert);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "create");
    }

    #[test]
    fn matches_come_back_in_ascending_priority_order() {
        let rules = RuleSet::new(vec![
            rule_for("second", DocEvent::AfterInsert, 2),
            rule_for("first", DocEvent::AfterInsert, 1),
            rule_for("third", DocEvent::AfterInsert, 3),
        ])
        .unwrap();
        let names: Vec<&str> = rules
            .match_rules("Customer", DocEvent::AfterInsert)
            .iter()
            .map(|rule| rule.name.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn passing_rules_fan_out_to_independent_jobs() {
        let rules = RuleSet::new(vec![
            rule_for("create", DocEvent::AfterInsert, 1),
            rule_for("welcome", DocEvent::AfterInsert, 2),
        ])
        .unwrap();
        let queue = InMemoryJobQueue::default();

        let enqueued =
            schedule_document_event(&rules, &queue, &customer_doc(), "after_insert").await.unwrap();
        assert_eq!(enqueued, 2);

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 2);
        assert_ne!(jobs[0].idempotency_key, jobs[1].idempotency_key);
    }

    #[tokio::test]
    async fn erroring_guard_skips_only_its_own_rule() {
        let mut bad_guard = rule_for("bad", DocEvent::AfterInsert, 1);
        bad_guard.condition = Some("settings.retry_limit > 0".to_string());
        let mut good = rule_for("good", DocEvent::AfterInsert, 2);
        good.condition = Some("doc.first_name == 'John'".to_string());

        let rules = RuleSet::new(vec![bad_guard, good]).unwrap();
        let queue = InMemoryJobQueue::default();

        let enqueued =
            schedule_document_event(&rules, &queue, &customer_doc(), "after_insert").await.unwrap();
        assert_eq!(enqueued, 1);
        assert_eq!(queue.jobs()[0].rule_name, "good");
    }

    #[tokio::test]
    async fn falsy_guard_and_unknown_event_enqueue_nothing() {
        let mut guarded = rule_for("guarded", DocEvent::AfterInsert, 1);
        guarded.condition = Some("doc.first_name == 'Jane'".to_string());
        let rules = RuleSet::new(vec![guarded]).unwrap();
        let queue = InMemoryJobQueue::default();

        let doc = customer_doc();
        assert_eq!(
            schedule_document_event(&rules, &queue, &doc, "after_insert").await.unwrap(),
            0
        );
        assert_eq!(
            schedule_document_event(&rules, &queue, &doc, "validate").await.unwrap(),
            0
        );
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn manual_retrigger_is_never_suppressed_by_a_prior_delivery() {
        let rules = RuleSet::new(vec![rule_for("create", DocEvent::AfterInsert, 1)]).unwrap();
        let queue = InMemoryJobQueue::default();
        let doc = customer_doc();

        schedule_document_event(&rules, &queue, &doc, "after_insert").await.unwrap();
        retrigger_rule(&rules, &queue, &doc, "create").await.unwrap();
        retrigger_rule(&rules, &queue, &doc, "create").await.unwrap();

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 3);
        assert_ne!(jobs[1].idempotency_key, jobs[0].idempotency_key);
        assert_ne!(jobs[2].idempotency_key, jobs[1].idempotency_key);

        let err = retrigger_rule(&rules, &queue, &doc, "nope").await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn replayed_event_deduplicates_on_the_idempotency_key() {
        let rules = RuleSet::new(vec![rule_for("create", DocEvent::AfterInsert, 1)]).unwrap();
        let queue = InMemoryJobQueue::default();
        let doc = customer_doc();

        assert_eq!(
            schedule_document_event(&rules, &queue, &doc, "after_insert").await.unwrap(),
            1
        );
        assert_eq!(
            schedule_document_event(&rules, &queue, &doc, "after_insert").await.unwrap(),
            0
        );
        assert_eq!(queue.jobs().len(), 1);
    }
}
