use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use common_kafka::kafka_consumer::create_kafka_consumer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::consumer::BatchingConsumer;
use crate::consumer_worker::ConsumerWorker;
use crate::producer::{KafkaProducer, MessageProducer};
use crate::source::KafkaStreamSource;
use crate::storage::{ClickHouseWriter, StorageWriter};

/// Wires Kafka, ClickHouse and the consumer together from [`Config`].
pub struct IngesterService {
    config: Config,
}

impl IngesterService {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn build_consumer(
        &self,
        shutdown: CancellationToken,
    ) -> Result<BatchingConsumer<KafkaStreamSource, ConsumerWorker>> {
        let batching = self
            .config
            .batching_config()
            .context("Invalid batching configuration")?;
        let worker_config = self
            .config
            .worker_config()
            .context("Invalid worker configuration")?;

        let consumer = create_kafka_consumer(&self.config.kafka, &self.config.consumer)
            .with_context(|| {
                format!(
                    "Failed to create Kafka consumer for topic '{}' with group '{}'",
                    self.config.consumer.kafka_consumer_topic,
                    self.config.consumer.kafka_consumer_group
                )
            })?;

        let producer: Arc<dyn MessageProducer> = Arc::new(
            KafkaProducer::new(&self.config.kafka)
                .await
                .context("Failed to create Kafka producer")?,
        );
        let writer: Arc<dyn StorageWriter> = Arc::new(ClickHouseWriter::new(&self.config).await?);

        let worker = ConsumerWorker::new(&worker_config, writer, producer.clone())
            .with_producer_flush_timeout(self.config.producer_flush_timeout());

        info!(
            topic = %self.config.consumer.kafka_consumer_topic,
            replacements_topic = %worker_config.replacements_topic(),
            commit_log_topic = ?batching.commit_log_topic(),
            dead_letter_topic = ?batching.dead_letter_topic(),
            "Initialized ingester"
        );

        BatchingConsumer::new(
            KafkaStreamSource::new(consumer),
            worker,
            batching,
            Some(producer),
            shutdown,
        )
        .context("Invalid consumer configuration")
    }

    /// Run until ctrl-c or SIGTERM, then flush and commit what is buffered.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let shutdown = CancellationToken::new();
        let mut consumer = self.build_consumer(shutdown.clone()).await?;

        let listener = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal.await;
                info!("Received shutdown signal, shutting down gracefully...");
                shutdown.cancel();
            }
        });

        let result = consumer.run().await;
        listener.abort();

        result.context("Consumer stopped with an error")?;
        info!("Event ingester stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
