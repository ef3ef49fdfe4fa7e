use std::time::Duration;

use async_trait::async_trait;
use common_kafka::config::KafkaConfig;
use common_kafka::kafka_producer::{
    create_kafka_producer, send_records_to_kafka, KafkaContext, KafkaRecord,
};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use tracing::{debug, error};

use super::MessageProducer;
use crate::error::ProduceError;

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaProducer {
    pub async fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        Ok(Self::from_producer(create_kafka_producer(config).await?))
    }

    pub fn from_producer(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn produce_all(
        &self,
        topic: &str,
        records: Vec<KafkaRecord>,
    ) -> Result<usize, ProduceError> {
        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        match send_records_to_kafka(&self.producer, topic, records).await {
            Ok(delivered) => {
                debug!(topic, delivered, "Records acknowledged");
                Ok(delivered)
            }
            Err(source) => {
                error!(topic, count, "Failed to deliver records: {source}");
                Err(ProduceError::Kafka {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        self.producer.flush(timeout).map_err(ProduceError::Flush)
    }
}
