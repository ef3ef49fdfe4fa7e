use std::sync::Arc;

use common_kafka::kafka_producer::KafkaRecord;
use metrics::counter;
use tracing::warn;

use crate::error::{ProcessingError, ProduceError};
use crate::metrics_consts::MESSAGES_DEAD_LETTERED;
use crate::producer::MessageProducer;
use crate::types::StreamMessage;

/// Sidelines messages that failed processing so the partition can move on.
pub struct DeadLetterRouter {
    producer: Arc<dyn MessageProducer>,
    topic: String,
}

impl DeadLetterRouter {
    pub fn new(producer: Arc<dyn MessageProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The original key and value untouched, plus where the message came from.
    pub fn record(message: &StreamMessage) -> KafkaRecord {
        KafkaRecord::new(message.key.clone(), message.value.clone())
            .with_header("partition", message.partition.to_string())
            .with_header("offset", message.offset.to_string())
            .with_header("topic", message.topic.clone())
    }

    pub async fn route(
        &self,
        message: &StreamMessage,
        reason: &ProcessingError,
    ) -> Result<(), ProduceError> {
        self.producer
            .produce(&self.topic, Self::record(message))
            .await?;

        counter!(MESSAGES_DEAD_LETTERED).increment(1);
        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            dead_letter_topic = %self.topic,
            "Dead-lettered message: {reason}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryProducer;

    #[tokio::test]
    async fn republishes_original_bytes_with_position_headers() {
        let producer = Arc::new(MemoryProducer::new());
        let router = DeadLetterRouter::new(producer.clone(), "events-dlq");
        let message = StreamMessage::new("t", 1, 2, b"value".to_vec()).with_key("key");

        router
            .route(&message, &ProcessingError::InvalidEvent("broken".into()))
            .await
            .expect("route succeeds");

        let produced = producer.produced("events-dlq");
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].key.as_deref(), Some(b"key".as_slice()));
        assert_eq!(produced[0].payload, b"value");
        assert_eq!(
            produced[0].headers,
            vec![
                ("partition".to_string(), "1".to_string()),
                ("offset".to_string(), "2".to_string()),
                ("topic".to_string(), "t".to_string()),
            ]
        );
    }

    #[test]
    fn keyless_messages_stay_keyless() {
        let message = StreamMessage::new("t", 0, 7, b"{}".to_vec());
        let record = DeadLetterRouter::record(&message);
        assert_eq!(record.key, None);
        assert_eq!(record.payload, b"{}");
    }
}
