use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use thiserror::Error;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    // Emit logs as JSON lines instead of the human readable format
    #[envconfig(default = "false")]
    pub log_json: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "event-replacements")]
    pub replacements_topic: String,

    // Where resumable offsets are recorded after every flush, if set
    pub commit_log_topic: Option<String>,

    // Where messages that fail processing are sidelined. Without it, such a failure stops the consumer
    pub dead_letter_topic: Option<String>,

    // Unknown actions usually mean a producer is ahead of us, so they stop the consumer unless this is set
    #[envconfig(default = "false")]
    pub dead_letter_invalid_actions: bool,

    #[envconfig(default = "50000")]
    pub max_batch_size: usize,

    #[envconfig(default = "2000")]
    pub max_batch_time_ms: u64,

    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    // Events older than this are dropped on the floor
    #[envconfig(default = "90")]
    pub max_event_age_days: u32,

    // Applied to rows whose event does not carry its own retention
    #[envconfig(default = "90")]
    pub default_retention_days: u16,

    #[envconfig(default = "30")]
    pub producer_flush_timeout_secs: u64,

    #[envconfig(default = "http://localhost:8123")]
    pub clickhouse_url: String,

    #[envconfig(default = "default")]
    pub clickhouse_database: String,

    #[envconfig(default = "default")]
    pub clickhouse_user: String,

    #[envconfig(default = "")]
    pub clickhouse_password: String,

    #[envconfig(default = "events")]
    pub clickhouse_table: String,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConsumerConfig::set_defaults("event-ingester", "events");
        Self::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn batching_config(&self) -> Result<BatchingConfig, ConfigError> {
        let mut builder = BatchingConfig::builder(&self.consumer.kafka_consumer_group)
            .source_topic(&self.consumer.kafka_consumer_topic)
            .max_batch_size(self.max_batch_size)
            .max_batch_time(Duration::from_millis(self.max_batch_time_ms))
            .poll_timeout(Duration::from_millis(self.poll_timeout_ms))
            .dead_letter_invalid_actions(self.dead_letter_invalid_actions);

        if let Some(topic) = &self.commit_log_topic {
            builder = builder.commit_log_topic(topic);
        }
        if let Some(topic) = &self.dead_letter_topic {
            builder = builder.dead_letter_topic(topic);
        }

        builder.build()
    }

    pub fn worker_config(&self) -> Result<WorkerConfig, ConfigError> {
        WorkerConfig::new(&self.replacements_topic, self.max_event_age_days)?
            .with_default_retention_days(self.default_retention_days)
    }

    pub fn producer_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.producer_flush_timeout_secs)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("max batch time must be greater than zero")]
    ZeroBatchTime,
    #[error("consumer group id must not be empty")]
    EmptyGroupId,
    #[error("{0} topic must not be the source topic")]
    TopicLoop(&'static str),
    #[error("{0} topic must not be empty")]
    EmptyTopic(&'static str),
    #[error("max event age must be at least one day")]
    ZeroEventAge,
    #[error("default retention must be at least one day")]
    ZeroRetention,
    #[error("{0} topic is configured but no producer was provided")]
    MissingProducer(&'static str),
}

/// Batching and routing settings for the consumer loop. Only obtainable
/// through [`BatchingConfigBuilder::build`], so every instance is valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingConfig {
    max_batch_size: usize,
    max_batch_time: Duration,
    poll_timeout: Duration,
    group_id: String,
    commit_log_topic: Option<String>,
    dead_letter_topic: Option<String>,
    dead_letter_invalid_actions: bool,
}

impl BatchingConfig {
    pub fn builder(group_id: impl Into<String>) -> BatchingConfigBuilder {
        BatchingConfigBuilder {
            max_batch_size: 50_000,
            max_batch_time: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(1),
            group_id: group_id.into(),
            source_topic: None,
            commit_log_topic: None,
            dead_letter_topic: None,
            dead_letter_invalid_actions: false,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_batch_time(&self) -> Duration {
        self.max_batch_time
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn commit_log_topic(&self) -> Option<&str> {
        self.commit_log_topic.as_deref()
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.dead_letter_topic.as_deref()
    }

    pub fn dead_letter_invalid_actions(&self) -> bool {
        self.dead_letter_invalid_actions
    }
}

pub struct BatchingConfigBuilder {
    max_batch_size: usize,
    max_batch_time: Duration,
    poll_timeout: Duration,
    group_id: String,
    source_topic: Option<String>,
    commit_log_topic: Option<String>,
    dead_letter_topic: Option<String>,
    dead_letter_invalid_actions: bool,
}

impl BatchingConfigBuilder {
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn max_batch_time(mut self, time: Duration) -> Self {
        self.max_batch_time = time;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// The topic being consumed. Only used to reject output topics that would
    /// feed back into the consumer.
    pub fn source_topic(mut self, topic: impl Into<String>) -> Self {
        self.source_topic = Some(topic.into());
        self
    }

    pub fn commit_log_topic(mut self, topic: impl Into<String>) -> Self {
        self.commit_log_topic = Some(topic.into());
        self
    }

    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn dead_letter_invalid_actions(mut self, enabled: bool) -> Self {
        self.dead_letter_invalid_actions = enabled;
        self
    }

    pub fn build(self) -> Result<BatchingConfig, ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_batch_time.is_zero() {
            return Err(ConfigError::ZeroBatchTime);
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::EmptyGroupId);
        }

        for (name, topic) in [
            ("commit log", &self.commit_log_topic),
            ("dead letter", &self.dead_letter_topic),
        ] {
            let Some(topic) = topic else { continue };
            if topic.is_empty() {
                return Err(ConfigError::EmptyTopic(name));
            }
            if self.source_topic.as_deref() == Some(topic.as_str()) {
                return Err(ConfigError::TopicLoop(name));
            }
        }

        Ok(BatchingConfig {
            max_batch_size: self.max_batch_size,
            max_batch_time: self.max_batch_time,
            poll_timeout: self.poll_timeout,
            group_id: self.group_id,
            commit_log_topic: self.commit_log_topic,
            dead_letter_topic: self.dead_letter_topic,
            dead_letter_invalid_actions: self.dead_letter_invalid_actions,
        })
    }
}

/// Settings for [`crate::consumer_worker::ConsumerWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    replacements_topic: String,
    max_event_age_days: u32,
    default_retention_days: u16,
}

impl WorkerConfig {
    pub fn new(
        replacements_topic: impl Into<String>,
        max_event_age_days: u32,
    ) -> Result<Self, ConfigError> {
        let replacements_topic = replacements_topic.into();
        if replacements_topic.is_empty() {
            return Err(ConfigError::EmptyTopic("replacements"));
        }
        if max_event_age_days == 0 {
            return Err(ConfigError::ZeroEventAge);
        }
        Ok(Self {
            replacements_topic,
            max_event_age_days,
            default_retention_days: 90,
        })
    }

    pub fn with_default_retention_days(mut self, days: u16) -> Result<Self, ConfigError> {
        if days == 0 {
            return Err(ConfigError::ZeroRetention);
        }
        self.default_retention_days = days;
        Ok(self)
    }

    pub fn replacements_topic(&self) -> &str {
        &self.replacements_topic
    }

    pub fn max_event_age_days(&self) -> u32 {
        self.max_event_age_days
    }

    pub fn default_retention_days(&self) -> u16 {
        self.default_retention_days
    }
}
