pub const MESSAGES_PRODUCED: &str = "bridge_messages_produced_total";
pub const MESSAGES_CONSUMED: &str = "bridge_messages_consumed_total";
pub const PRODUCE_FAILURES: &str = "bridge_produce_failures_total";
pub const CONSUME_FAILURES: &str = "bridge_consume_failures_total";
pub const DUPLICATES_SUPPRESSED: &str = "bridge_duplicates_suppressed_total";
pub const DEAD_LETTERS: &str = "bridge_dead_letters_total";
pub const HANDLER_SKIPS: &str = "bridge_handler_skips_total";
pub const ACTION_FAILURES: &str = "bridge_action_failures_total";
pub const SCHEMA_CACHE_HITS: &str = "bridge_schema_cache_hits_total";
pub const SCHEMA_CACHE_MISSES: &str = "bridge_schema_cache_misses_total";
pub const SCHEMA_REGISTRY_FETCHES: &str = "bridge_schema_registry_fetches_total";
pub const PRODUCE_TIME: &str = "bridge_produce_time_seconds";
pub const CONSUME_TIME: &str = "bridge_consume_time_seconds";
pub const STALE_PENDING_SWEPT: &str = "bridge_stale_pending_swept_total";
pub const JOBS_ENQUEUED: &str = "bridge_jobs_enqueued_total";
pub const JOBS_DEQUEUED: &str = "bridge_jobs_dequeued_total";
pub const JOBS_RECLAIMED: &str = "bridge_jobs_reclaimed_total";
