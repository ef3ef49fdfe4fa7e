use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchAccumulator;
use crate::commit_log::CommitLogPublisher;
use crate::config::{BatchingConfig, ConfigError};
use crate::dead_letter::DeadLetterRouter;
use crate::error::{ConsumerError, ProcessingError};
use crate::metrics_consts::{
    BATCHES_FLUSHED, BATCH_SIZE, COMMITTED_OFFSET, FLUSH_DURATION_MS, MESSAGES_CONSUMED,
    MESSAGES_DROPPED, OFFSETS_COMMITTED,
};
use crate::producer::MessageProducer;
use crate::source::StreamSource;
use crate::types::{Partition, StreamMessage};
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    Flushing,
    ShuttingDown,
    Closed,
}

/// Polls a [`StreamSource`], feeds each message through a [`Worker`] and
/// flushes the accepted results in batches.
///
/// Offsets are committed only after the worker's flush returns, so a crash
/// anywhere before that replays the batch. Messages that fail processing
/// are sidelined to the dead-letter topic when one is configured; otherwise
/// they stop the consumer.
pub struct BatchingConsumer<S, W: Worker> {
    source: S,
    worker: W,
    config: BatchingConfig,
    commit_log: Option<CommitLogPublisher>,
    dead_letter: Option<DeadLetterRouter>,
    batch: BatchAccumulator<W::Output>,
    // highest offset handled per partition since the last commit
    offsets: HashMap<Partition, i64>,
    state: ConsumerState,
    shutdown: CancellationToken,
}

impl<S, W> BatchingConsumer<S, W>
where
    S: StreamSource,
    W: Worker,
{
    pub fn new(
        source: S,
        worker: W,
        config: BatchingConfig,
        producer: Option<Arc<dyn MessageProducer>>,
        shutdown: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let commit_log = match (config.commit_log_topic(), &producer) {
            (Some(topic), Some(producer)) => Some(CommitLogPublisher::new(
                producer.clone(),
                topic,
                config.group_id(),
            )),
            (Some(_), None) => return Err(ConfigError::MissingProducer("commit log")),
            (None, _) => None,
        };
        let dead_letter = match (config.dead_letter_topic(), &producer) {
            (Some(topic), Some(producer)) => Some(DeadLetterRouter::new(producer.clone(), topic)),
            (Some(_), None) => return Err(ConfigError::MissingProducer("dead letter")),
            (None, _) => None,
        };

        Ok(Self {
            source,
            worker,
            config,
            commit_log,
            dead_letter,
            batch: BatchAccumulator::new(),
            offsets: HashMap::new(),
            state: ConsumerState::Running,
            shutdown,
        })
    }

    /// Run until the shutdown token is cancelled or a fatal error occurs.
    ///
    /// On shutdown whatever is buffered is flushed and committed before the
    /// worker and the source are closed. On error nothing more is committed.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        info!(
            group = %self.config.group_id(),
            max_batch_size = self.config.max_batch_size(),
            max_batch_time_ms = self.config.max_batch_time().as_millis() as u64,
            "Starting batching consumer"
        );

        while !self.shutdown.is_cancelled() {
            if let Err(e) = self.run_once().await {
                error!("Consumer stopped without committing the open batch: {e}");
                self.abort().await;
                return Err(e);
            }
        }

        info!("Shutdown signal received, flushing before exit");
        self.shutdown().await
    }

    /// One poll, at most one message handled, and whatever flushes that triggers.
    pub async fn run_once(&mut self) -> Result<(), ConsumerError> {
        let shutdown = self.shutdown.clone();
        let polled = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            polled = self.source.poll(self.config.poll_timeout()) => polled?,
        };

        // The time trigger is judged before the new message joins the batch
        if self.should_flush() {
            self.flush().await?;
        }

        let Some(message) = polled else {
            return Ok(());
        };

        self.handle_message(message).await?;

        if self.should_flush() {
            self.flush().await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: StreamMessage) -> Result<(), ConsumerError> {
        match self.worker.process_message(&message) {
            Ok(Some(output)) => {
                counter!(MESSAGES_CONSUMED, "outcome" => "accepted").increment(1);
                self.batch.add(output, Instant::now());
                self.track_offset(&message);
            }
            Ok(None) => {
                counter!(MESSAGES_CONSUMED, "outcome" => "dropped").increment(1);
                counter!(MESSAGES_DROPPED).increment(1);
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Dropped message"
                );
                self.track_offset(&message);
            }
            Err(e) => {
                counter!(MESSAGES_CONSUMED, "outcome" => "failed").increment(1);
                self.handle_processing_error(&message, e).await?;
                self.track_offset(&message);
            }
        }
        Ok(())
    }

    async fn handle_processing_error(
        &self,
        message: &StreamMessage,
        e: ProcessingError,
    ) -> Result<(), ConsumerError> {
        let dead_letterable = !e.is_invalid_action() || self.config.dead_letter_invalid_actions();

        match &self.dead_letter {
            Some(router) if dead_letterable => router
                .route(message, &e)
                .await
                .map_err(ConsumerError::DeadLetter),
            _ => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Failed to process message: {e}"
                );
                Err(ConsumerError::Processing {
                    topic: message.topic.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    source: e,
                })
            }
        }
    }

    fn track_offset(&mut self, message: &StreamMessage) {
        let highest = self.offsets.entry(message.partition()).or_insert(message.offset);
        if message.offset > *highest {
            *highest = message.offset;
        }
    }

    fn should_flush(&self) -> bool {
        self.batch.should_flush(
            Instant::now(),
            self.config.max_batch_size(),
            self.config.max_batch_time(),
        )
    }

    /// Hand the batch to the worker, then commit everything handled so far.
    pub async fn flush(&mut self) -> Result<(), ConsumerError> {
        if self.state == ConsumerState::Running {
            self.state = ConsumerState::Flushing;
        }

        let items = self.batch.drain();
        if !items.is_empty() {
            let count = items.len();
            let start = Instant::now();
            self.worker.flush_batch(items).await?;

            histogram!(FLUSH_DURATION_MS).record(start.elapsed().as_millis() as f64);
            histogram!(BATCH_SIZE).record(count as f64);
            counter!(BATCHES_FLUSHED).increment(1);
            debug!(count, "Flushed batch");
        }

        self.commit().await?;

        if self.state == ConsumerState::Flushing {
            self.state = ConsumerState::Running;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConsumerError> {
        if self.offsets.is_empty() {
            return Ok(());
        }

        let next_offsets: HashMap<Partition, i64> = self
            .offsets
            .iter()
            .map(|(partition, offset)| (partition.clone(), offset + 1))
            .collect();

        self.source.commit(&next_offsets).await?;
        self.offsets.clear();

        counter!(OFFSETS_COMMITTED).increment(next_offsets.len() as u64);
        for (partition, offset) in &next_offsets {
            gauge!(
                COMMITTED_OFFSET,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .set(*offset as f64);
        }

        if let Some(commit_log) = &self.commit_log {
            commit_log
                .publish(&next_offsets)
                .await
                .map_err(ConsumerError::CommitLog)?;
        }
        Ok(())
    }

    /// Final flush regardless of triggers, then release the worker and source.
    pub async fn shutdown(&mut self) -> Result<(), ConsumerError> {
        if self.state == ConsumerState::Closed {
            return Ok(());
        }
        self.state = ConsumerState::ShuttingDown;

        let flushed = self.flush().await;
        if let Err(e) = &flushed {
            error!("Final flush failed, buffered messages will be replayed: {e}");
        }

        match self.source.assignment() {
            Ok(partitions) => info!(?partitions, "Releasing partitions"),
            Err(e) => warn!("Failed to read partition assignment: {e}"),
        }

        self.worker.shutdown().await;
        self.source.close().await;
        self.state = ConsumerState::Closed;
        info!("Batching consumer closed");
        flushed
    }

    async fn abort(&mut self) {
        self.state = ConsumerState::ShuttingDown;
        let dropped = self.batch.drain().len();
        if dropped > 0 {
            warn!(dropped, "Discarding uncommitted batch");
        }
        self.offsets.clear();
        self.worker.shutdown().await;
        self.source.close().await;
        self.state = ConsumerState::Closed;
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}
