use thiserror::Error;

/// Errors for the document-to-Kafka bridge.
///
/// The taxonomy matters operationally: `Transport` and `Database` are
/// retryable by the caller's retry policy, `SchemaNotFound` and `Coercion`
/// are fatal to the current attempt, and `InnerDecode` maps to the
/// dead-letter policy while `EnvelopeDecode` is a transport-level failure.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("cannot coerce field {field} to {target}: {reason}")]
    Coercion {
        field: String,
        target: String,
        reason: String,
    },

    #[error("failed to decode inner payload: {0}")]
    InnerDecode(String),

    #[error("failed to decode envelope: {0}")]
    EnvelopeDecode(String),

    #[error("expression evaluation failed: {0}")]
    Evaluation(#[from] crate::expr::EvalError),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("schema registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("permission denied on {entity}")]
    PermissionDenied { entity: String },

    #[error("message delivery timed out")]
    DeliveryTimeout,
}

impl BridgeError {
    /// Whether retrying the same attempt later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Kafka(_)
                | BridgeError::Registry(_)
                | BridgeError::Database(_)
                | BridgeError::DeliveryTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_database_errors_are_retryable() {
        assert!(BridgeError::DeliveryTimeout.is_retryable());
        assert!(BridgeError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!BridgeError::SchemaNotFound("x".to_string()).is_retryable());
        assert!(!BridgeError::Coercion {
            field: "f".to_string(),
            target: "int".to_string(),
            reason: "not numeric".to_string(),
        }
        .is_retryable());
    }
}
