use std::time::Duration;

use metrics::gauge;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;

// How long to wait for librdkafka to drain its local queue before retrying an enqueue
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Default)]
pub struct KafkaContext;

impl ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("kafka_producer_callback_queue_depth").set(stats.replyq as f64);
    }
}

/// Producer settings derived from `config`. Idempotence keeps records sharing a
/// partition in send order when requests are retried; without it only one request
/// may be in flight per connection.
pub fn producer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_enable_idempotence {
        client_config
            .set("enable.idempotence", "true")
            .set(
                "max.in.flight.requests.per.connection",
                config.kafka_max_in_flight.to_string(),
            );
    } else {
        client_config
            .set("enable.idempotence", "false")
            .set("max.in.flight.requests.per.connection", "1");
    }

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let client_config = producer_client_config(config);
    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// A message ready to be produced: raw key and payload bytes, plus string headers
/// kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl KafkaRecord {
    pub fn new(key: Option<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self {
            key,
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    fn owned_headers(&self) -> Option<OwnedHeaders> {
        if self.headers.is_empty() {
            return None;
        }
        let headers = self
            .headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.headers.len()), |acc, (key, value)| {
                acc.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            });
        Some(headers)
    }
}

/// Enqueue every record, then wait for all of their delivery reports.
///
/// Records are enqueued in iteration order, so records sharing a key land in their
/// partition in that order. Delivery reports are awaited in the same order and the
/// first failure is returned; the remaining reports are dropped. Returns the number
/// of acknowledged records.
pub async fn send_records_to_kafka<C: ClientContext + 'static>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    records: impl IntoIterator<Item = KafkaRecord>,
) -> Result<usize, KafkaProduceError> {
    let mut handles: Vec<DeliveryFuture> = Vec::new();

    for record in records {
        let mut future_record = FutureRecord {
            topic,
            key: record.key.as_deref(),
            payload: Some(record.payload.as_slice()),
            timestamp: None,
            partition: None,
            headers: record.owned_headers(),
        };

        let handle = loop {
            match kafka_producer.send_result(future_record) {
                Ok(handle) => break handle,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    warn!(topic, "Producer queue full, waiting for deliveries");
                    future_record = returned;
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((error, _)) => {
                    return Err(KafkaProduceError::KafkaProduceError { error });
                }
            }
        };

        handles.push(handle);
    }

    let delivered = handles.len();
    for handle in handles {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err((error, _))) => return Err(KafkaProduceError::KafkaProduceError { error }),
            Err(_) => return Err(KafkaProduceError::KafkaProduceCanceled),
        }
    }

    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use rdkafka::message::Headers;

    use super::*;

    #[test]
    fn headers_keep_insertion_order() {
        let record = KafkaRecord::new(Some(b"key".to_vec()), b"value".to_vec())
            .with_header("partition", "1")
            .with_header("offset", "2")
            .with_header("topic", "t");

        let headers = record.owned_headers().expect("headers present");
        assert_eq!(headers.count(), 3);
        assert_eq!(headers.get(0).key, "partition");
        assert_eq!(headers.get(0).value, Some(b"1".as_slice()));
        assert_eq!(headers.get(1).key, "offset");
        assert_eq!(headers.get(2).key, "topic");
        assert_eq!(headers.get(2).value, Some(b"t".as_slice()));
    }

    fn kafka_config(idempotence: bool) -> KafkaConfig {
        KafkaConfig {
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_producer_queue_messages: 10_000_000,
            kafka_message_timeout_ms: 20000,
            kafka_compression_codec: "none".to_string(),
            kafka_enable_idempotence: idempotence,
            kafka_max_in_flight: 5,
            kafka_tls: false,
            kafka_hosts: "kafka:9092".to_string(),
        }
    }

    #[test]
    fn producer_keeps_partition_order_across_retries() {
        let config = producer_client_config(&kafka_config(true));

        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(
            config.get("max.in.flight.requests.per.connection"),
            Some("5")
        );
        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn producer_without_idempotence_sends_one_request_at_a_time() {
        let config = producer_client_config(&kafka_config(false));

        assert_eq!(config.get("enable.idempotence"), Some("false"));
        assert_eq!(
            config.get("max.in.flight.requests.per.connection"),
            Some("1")
        );
    }

    #[test]
    fn no_headers_means_none() {
        let record = KafkaRecord::new(None, b"{}".to_vec());
        assert!(record.owned_headers().is_none());
    }
}
