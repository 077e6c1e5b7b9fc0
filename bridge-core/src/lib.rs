//! Bidirectional bridge between a document-oriented business application
//! and an Apache Fineract event/command bus.
//!
//! Outbound: document events match emission rules, fan out to deferred
//! produce jobs, and become Avro command messages on the broker. Inbound:
//! a poll loop decodes business events, deduplicates them, and dispatches
//! matched handlers' actions. The audit log ties both directions together
//! and carries the at-most-once delivery guarantee.

pub mod audit;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod documents;
pub mod error;
pub mod expr;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod jobs;
pub mod kafka;
pub mod maintenance;
pub mod mapping;
pub mod metrics_consts;
pub mod producer;
pub mod registry;
pub mod rules;
pub mod schema;
pub mod serve;
pub mod test_utils;
pub mod types;

pub use error::BridgeError;
