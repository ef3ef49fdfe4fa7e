use common_kafka::kafka_producer::KafkaProduceError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failure to turn a single message into something batchable.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("invalid action type: {0}")]
    InvalidActionType(String),
    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(i64),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl ProcessingError {
    pub fn is_invalid_action(&self) -> bool {
        matches!(self, ProcessingError::InvalidActionType(_))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("clickhouse write failed: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to produce to {topic}: {source}")]
    Kafka {
        topic: String,
        #[source]
        source: KafkaProduceError,
    },
    #[error("failed to flush producer: {0}")]
    Flush(#[source] KafkaError),
    #[error("delivery to {topic} failed: {reason}")]
    Delivery { topic: String, reason: String },
}

/// A failed flush. The batch stays uncommitted and is replayed on restart.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("storage write failed: {0}")]
    Storage(#[from] StorageError),
    #[error("replacement delivery failed: {0}")]
    ReplacementDelivery(#[from] ProduceError),
    #[error("failed to serialize replacement: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka consumer error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("source is closed")]
    Closed,
}

/// Anything that stops the consumer loop. None of these commit the open batch.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to process message at {topic}:{partition}@{offset}: {source}")]
    Processing {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: ProcessingError,
    },
    #[error("flush failed: {0}")]
    Flush(#[from] FlushError),
    #[error("source failed: {0}")]
    Source(#[from] SourceError),
    #[error("failed to dead-letter message: {0}")]
    DeadLetter(#[source] ProduceError),
    #[error("failed to publish commit log: {0}")]
    CommitLog(#[source] ProduceError),
}
