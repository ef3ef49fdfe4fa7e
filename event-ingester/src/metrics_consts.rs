// ==== Consumer loop ====
/// Counter for messages returned by the source, labelled by outcome
pub const MESSAGES_CONSUMED: &str = "event_ingester_messages_consumed_total";

/// Counter for messages the worker chose to drop (stale events)
pub const MESSAGES_DROPPED: &str = "event_ingester_messages_dropped_total";

/// Counter for messages republished to the dead-letter topic
pub const MESSAGES_DEAD_LETTERED: &str = "event_ingester_messages_dead_lettered_total";

/// Counter for flushes that completed and were committed
pub const BATCHES_FLUSHED: &str = "event_ingester_batches_flushed_total";

/// Histogram of items per flushed batch
pub const BATCH_SIZE: &str = "event_ingester_batch_size";

/// Histogram of time spent in Worker::flush_batch
pub const FLUSH_DURATION_MS: &str = "event_ingester_flush_duration_ms";

/// Counter for partitions whose offset was committed
pub const OFFSETS_COMMITTED: &str = "event_ingester_offsets_committed_total";

/// Gauge of the last committed offset, labelled by partition
pub const COMMITTED_OFFSET: &str = "event_ingester_committed_offset";

/// Counter for records written to the commit log topic
pub const COMMIT_LOG_RECORDS: &str = "event_ingester_commit_log_records_total";

/// Counter for Kafka consumer errors, labelled by level and error kind
pub const KAFKA_CONSUMER_ERROR: &str = "event_ingester_kafka_consumer_error_total";

// ==== Consumer worker ====
/// Rows handed to the storage writer, observed once per flush that has inserts
pub const INSERTS: &str = "inserts";

/// Histogram of time spent in the storage writer
pub const INSERT_DURATION_MS: &str = "event_ingester_insert_duration_ms";

/// Counter for replacement messages acknowledged by the broker
pub const REPLACEMENTS_PRODUCED: &str = "event_ingester_replacements_produced_total";

/// Counter for messages rejected by the processor, labelled by reason
pub const PROCESSING_ERRORS: &str = "event_ingester_processing_errors_total";
