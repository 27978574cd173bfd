// ==== Poll loop ====
/// Counter for records received from the broker
pub const RECORDS_RECEIVED: &str = "kafka_subscriber_records_received_total";

/// Counter for broker errors surfaced by poll
pub const BROKER_ERRORS: &str = "kafka_subscriber_broker_errors_total";

/// Counter for rebalance events handled, labelled by event_type
pub const REBALANCE_EVENTS: &str = "kafka_subscriber_rebalance_events_total";

/// Counter for empty rebalance notices skipped in the client context
pub const REBALANCE_EMPTY_SKIPPED: &str = "kafka_subscriber_rebalance_empty_skipped_total";

// ==== Dispatch ====
/// Counter for records that could not be handed to a dispatch queue
pub const DISPATCH_ERRORS: &str = "kafka_subscriber_dispatch_errors_total";

/// Counter for hand-offs that had to wait for queue capacity
pub const DISPATCH_BACKPRESSURE_TOTAL: &str = "kafka_subscriber_dispatch_backpressure_total";

/// Histogram for time spent waiting on a full queue (ms)
pub const DISPATCH_BACKPRESSURE_WAIT_MS: &str = "kafka_subscriber_dispatch_backpressure_wait_ms";

/// Counter for queued records dropped by a fast close or revoke
pub const DISPATCH_RECORDS_DISCARDED: &str = "kafka_subscriber_records_discarded_total";

// ==== Handler runner ====
/// Counter for handler outcomes, labelled by outcome
pub const HANDLER_OUTCOMES: &str = "kafka_subscriber_handler_outcomes_total";

/// Counter for handler retries
pub const HANDLER_RETRIES: &str = "kafka_subscriber_handler_retries_total";

/// Histogram for a single handler attempt duration (ms)
pub const HANDLER_ATTEMPT_DURATION_MS: &str = "kafka_subscriber_handler_attempt_duration_ms";

/// Counter for error handler invocations that timed out or panicked
pub const ERROR_HANDLER_FAILURES: &str = "kafka_subscriber_error_handler_failures_total";

// ==== Offsets ====
/// Counter for offsets stored for commit
pub const OFFSETS_MARKED: &str = "kafka_subscriber_offsets_marked_total";

/// Counter for offset store failures
pub const OFFSET_STORE_FAILURES: &str = "kafka_subscriber_offset_store_failures_total";

/// Gauge for the highest committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "kafka_subscriber_partition_last_committed_offset";

/// Counter for completions that arrived while an earlier offset was still in progress
pub const OUT_OF_ORDER_COMPLETIONS: &str = "kafka_subscriber_out_of_order_completions_total";

// ==== Pause / resume ====
/// Counter for pause and resume broker calls, labelled by action
pub const PAUSE_RESUME_CALLS: &str = "kafka_subscriber_pause_resume_calls_total";
