use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::BridgeError;

/// Deterministic dedup key for an outbound production attempt.
///
/// Hashing the document identity together with the event and rule means the
/// same logical trigger always maps to the same key, so a crashed worker can
/// be re-run safely: the audit store dedup check will suppress the repeat.
pub fn producer_key(
    entity_type: &str,
    entity_id: &str,
    event: &str,
    command_type: &str,
    rule_name: &str,
) -> Result<String, BridgeError> {
    for (name, value) in [
        ("entity_type", entity_type),
        ("entity_id", entity_id),
        ("event", event),
        ("command_type", command_type),
        ("rule_name", rule_name),
    ] {
        if value.is_empty() {
            return Err(BridgeError::InvalidArgument(format!(
                "producer key requires a non-empty {name}"
            )));
        }
    }

    Ok(digest(&format!(
        "{entity_type}:{entity_id}:{event}:{command_type}:{rule_name}"
    )))
}

/// Deterministic dedup key for a consumed message, unique per physical
/// message regardless of payload content.
pub fn consumer_key(topic: &str, partition: i32, offset: i64) -> Result<String, BridgeError> {
    if topic.is_empty() {
        return Err(BridgeError::InvalidArgument(
            "consumer key requires a non-empty topic".to_string(),
        ));
    }

    Ok(digest(&format!("{topic}:{partition}:{offset}")))
}

/// Key for an operator-initiated re-trigger of an already delivered event.
/// A random salt is mixed into the tuple so the dedup check never
/// suppresses a deliberate replay.
pub fn retrigger_key(
    entity_type: &str,
    entity_id: &str,
    event: &str,
    command_type: &str,
    rule_name: &str,
) -> Result<String, BridgeError> {
    let base = producer_key(entity_type, entity_id, event, command_type, rule_name)?;
    Ok(digest(&format!("{base}:{}", Uuid::new_v4())))
}

fn digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_key_is_deterministic() {
        let a = producer_key("Customer", "CUST-0001", "after_insert", "CreateClient", "r1")
            .unwrap();
        let b = producer_key("Customer", "CUST-0001", "after_insert", "CreateClient", "r1")
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn producer_key_changes_with_any_input() {
        let base = producer_key("Customer", "CUST-0001", "after_insert", "CreateClient", "r1")
            .unwrap();
        let variants = [
            producer_key("Supplier", "CUST-0001", "after_insert", "CreateClient", "r1"),
            producer_key("Customer", "CUST-0002", "after_insert", "CreateClient", "r1"),
            producer_key("Customer", "CUST-0001", "on_update", "CreateClient", "r1"),
            producer_key("Customer", "CUST-0001", "after_insert", "UpdateClient", "r1"),
            producer_key("Customer", "CUST-0001", "after_insert", "CreateClient", "r2"),
        ];
        for variant in variants {
            assert_ne!(base, variant.unwrap());
        }
    }

    #[test]
    fn producer_key_rejects_empty_inputs() {
        let err = producer_key("", "CUST-0001", "after_insert", "CreateClient", "r1");
        assert!(matches!(err, Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn retrigger_key_is_never_suppressible() {
        let deterministic =
            producer_key("Customer", "CUST-0001", "after_insert", "CreateClient", "r1").unwrap();
        let a = retrigger_key("Customer", "CUST-0001", "after_insert", "CreateClient", "r1")
            .unwrap();
        let b = retrigger_key("Customer", "CUST-0001", "after_insert", "CreateClient", "r1")
            .unwrap();
        assert_ne!(a, deterministic);
        assert_ne!(a, b);
    }

    #[test]
    fn consumer_key_is_unique_per_offset() {
        let a = consumer_key("fineract.events", 0, 42).unwrap();
        let b = consumer_key("fineract.events", 0, 43).unwrap();
        let c = consumer_key("fineract.events", 1, 42).unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, consumer_key("fineract.events", 0, 42).unwrap());
    }

    #[test]
    fn consumer_key_rejects_empty_topic() {
        assert!(matches!(
            consumer_key("", 0, 1),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
