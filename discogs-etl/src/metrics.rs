//! Metric names and labels emitted by the pipeline.

/// Label for the data type in metrics.
pub const DATA_TYPE_LABEL: &str = "data_type";

/// Label for the upstream dependency (bus or sink) in metrics.
pub const DEPENDENCY_LABEL: &str = "dependency";

/// Label for the operation being retried.
pub const OPERATION_LABEL: &str = "operation";

/// Label for error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for the reason a batch was flushed.
pub const FLUSH_REASON_LABEL: &str = "reason";

// Extractor metrics

/// Counter for records published to the bus.
pub const DISCOGS_RECORDS_PUBLISHED_TOTAL: &str = "discogs_records_published_total";

/// Counter for records skipped because they could not be decoded.
pub const DISCOGS_RECORDS_MALFORMED_TOTAL: &str = "discogs_records_malformed_total";

/// Counter for publishes that failed after all attempts.
pub const DISCOGS_PUBLISH_FAILURES_TOTAL: &str = "discogs_publish_failures_total";

/// Counter for state marker checkpoints.
pub const DISCOGS_CHECKPOINTS_TOTAL: &str = "discogs_checkpoints_total";

/// Gauge set to 1 while a data type is reported as stalled.
pub const DISCOGS_EXTRACTION_STALLED: &str = "discogs_extraction_stalled";

/// Counter for dump files fully processed.
pub const DISCOGS_FILES_COMPLETED_TOTAL: &str = "discogs_files_completed_total";

/// Counter for periodic extraction passes that failed.
pub const DISCOGS_EXTRACTION_PASS_FAILURES_TOTAL: &str = "discogs_extraction_pass_failures_total";

// Loader metrics

/// Counter for batch flushes.
pub const DISCOGS_BATCH_FLUSHES_TOTAL: &str = "discogs_batch_flushes_total";

/// Counter for batch flushes that failed and were requeued.
pub const DISCOGS_BATCH_FLUSH_FAILURES_TOTAL: &str = "discogs_batch_flush_failures_total";

/// Histogram of records written per flush, after deduplication.
pub const DISCOGS_BATCH_SIZE: &str = "discogs_batch_size";

/// Histogram of flush durations in seconds.
pub const DISCOGS_BATCH_FLUSH_DURATION_SECONDS: &str = "discogs_batch_flush_duration_seconds";

/// Counter for records written to a sink.
pub const DISCOGS_RECORDS_LOADED_TOTAL: &str = "discogs_records_loaded_total";

/// Counter for records that repeatedly failed to flush.
pub const DISCOGS_POISON_MESSAGES_TOTAL: &str = "discogs_poison_messages_total";

/// Counter for failed attempts to replace a broken subscription.
pub const DISCOGS_RESUBSCRIBE_FAILURES_TOTAL: &str = "discogs_resubscribe_failures_total";

/// Gauge of the consumer lifecycle state (0 active, 1 completion pending, 2 cancelled).
pub const DISCOGS_CONSUMER_STATE: &str = "discogs_consumer_state";

// Resilience metrics

/// Gauge of the circuit breaker state (0 closed, 1 half open, 2 open).
pub const DISCOGS_CIRCUIT_BREAKER_STATE: &str = "discogs_circuit_breaker_state";

/// Counter for circuit breaker trips.
pub const DISCOGS_CIRCUIT_BREAKER_TRIPS_TOTAL: &str = "discogs_circuit_breaker_trips_total";

/// Counter for retried attempts.
pub const DISCOGS_RETRY_ATTEMPTS_TOTAL: &str = "discogs_retry_attempts_total";

/// Gauge set to 1 while a dependency passes its health probe.
pub const DISCOGS_CONNECTION_HEALTHY: &str = "discogs_connection_healthy";

/// Counter for connections established, including reconnects.
pub const DISCOGS_CONNECTIONS_ESTABLISHED_TOTAL: &str = "discogs_connections_established_total";
