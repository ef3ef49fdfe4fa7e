use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig,
};
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Builds the librdkafka configuration for a group consumer that owns its
/// offset commits.
///
/// Auto commit and auto offset store are both disabled: the caller decides
/// when a position is safe to commit, and commits it explicitly.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("statistics.interval.ms", "10000")
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// A flush that blocks longer than this gets the consumer kicked out of the
    /// group, so it has to stay above the worst case storage write time.
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl From<(&KafkaConfig, &ConsumerConfig)> for ConsumerConfigBuilder {
    fn from((common, consumer): (&KafkaConfig, &ConsumerConfig)) -> Self {
        ConsumerConfigBuilder::new(&common.kafka_hosts, &consumer.kafka_consumer_group)
            .with_tls(common.kafka_tls)
            .with_offset_reset(&consumer.kafka_consumer_offset_reset)
            .with_session_timeout_ms(consumer.kafka_consumer_session_timeout_ms)
            .with_max_poll_interval_ms(consumer.kafka_consumer_max_poll_interval_ms)
    }
}

/// Create a consumer subscribed to the configured topic, with manual offset commits.
pub fn create_kafka_consumer(
    common_config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
) -> Result<StreamConsumer, KafkaError> {
    let client_config = ConsumerConfigBuilder::from((common_config, consumer_config)).build();
    debug!("rdkafka consumer configuration: {:?}", client_config);

    let consumer: StreamConsumer = client_config.create()?;
    consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

    info!(
        topic = %consumer_config.kafka_consumer_topic,
        group = %consumer_config.kafka_consumer_group,
        "Subscribed Kafka consumer"
    );

    Ok(consumer)
}
