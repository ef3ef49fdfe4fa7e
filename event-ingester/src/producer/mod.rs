use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_producer::KafkaRecord;

use crate::error::ProduceError;

pub mod kafka;

pub use self::kafka::KafkaProducer;

/// Publishes records to a topic and reports when the broker has them.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Publish `records` in order and wait until each one is acknowledged.
    /// Fails with the first error in publish order. Returns how many records
    /// were acknowledged.
    async fn produce_all(&self, topic: &str, records: Vec<KafkaRecord>)
        -> Result<usize, ProduceError>;

    async fn produce(&self, topic: &str, record: KafkaRecord) -> Result<(), ProduceError> {
        self.produce_all(topic, vec![record]).await.map(|_| ())
    }

    /// Wait for anything still in flight, up to `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError>;
}
