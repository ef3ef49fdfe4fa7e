use std::collections::HashMap;
use std::sync::Arc;

use common_kafka::kafka_producer::KafkaRecord;
use metrics::counter;
use tracing::debug;

use crate::error::ProduceError;
use crate::metrics_consts::COMMIT_LOG_RECORDS;
use crate::producer::MessageProducer;
use crate::types::Partition;

/// Records the resumable offset of every committed partition, keyed by
/// `{topic}:{partition}:{group_id}` with the next offset as a decimal string.
pub struct CommitLogPublisher {
    producer: Arc<dyn MessageProducer>,
    topic: String,
    group_id: String,
}

impl CommitLogPublisher {
    pub fn new(
        producer: Arc<dyn MessageProducer>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            group_id: group_id.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn record(&self, partition: &Partition, next_offset: i64) -> KafkaRecord {
        let key = format!(
            "{}:{}:{}",
            partition.topic(),
            partition.partition_number(),
            self.group_id
        );
        KafkaRecord::new(Some(key.into_bytes()), next_offset.to_string().into_bytes())
    }

    pub async fn publish(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ProduceError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut committed: Vec<_> = offsets.iter().collect();
        committed.sort();
        let records: Vec<_> = committed
            .into_iter()
            .map(|(partition, offset)| self.record(partition, *offset))
            .collect();

        let published = self.producer.produce_all(&self.topic, records).await?;
        counter!(COMMIT_LOG_RECORDS).increment(published as u64);
        debug!(topic = %self.topic, published, "Published commit log records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryProducer;

    #[tokio::test]
    async fn publishes_one_record_per_partition() {
        let producer = Arc::new(MemoryProducer::new());
        let publisher = CommitLogPublisher::new(producer.clone(), "events-commit-log", "ingest");

        let offsets = HashMap::from([
            (Partition::new("events", 1), 10),
            (Partition::new("events", 0), 3),
        ]);
        publisher.publish(&offsets).await.expect("publish succeeds");

        let produced = producer.produced("events-commit-log");
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0].key.as_deref(), Some(b"events:0:ingest".as_slice()));
        assert_eq!(produced[0].payload, b"3");
        assert_eq!(produced[1].key.as_deref(), Some(b"events:1:ingest".as_slice()));
        assert_eq!(produced[1].payload, b"10");
        assert!(produced[0].headers.is_empty());
    }

    #[tokio::test]
    async fn nothing_committed_publishes_nothing() {
        let producer = Arc::new(MemoryProducer::new());
        let publisher = CommitLogPublisher::new(producer.clone(), "events-commit-log", "ingest");

        publisher
            .publish(&HashMap::new())
            .await
            .expect("publish succeeds");
        assert!(producer.produced("events-commit-log").is_empty());
    }
}
