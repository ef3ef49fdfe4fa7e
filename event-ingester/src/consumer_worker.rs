use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_producer::KafkaRecord;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::error::{FlushError, ProcessingError};
use crate::events::{EventProcessor, EventRow, ProcessedMessage, Replacement};
use crate::metrics_consts::{
    INSERTS, INSERT_DURATION_MS, PROCESSING_ERRORS, REPLACEMENTS_PRODUCED,
};
use crate::producer::MessageProducer;
use crate::storage::StorageWriter;
use crate::types::StreamMessage;
use crate::worker::Worker;

/// Writes inserts to storage and forwards replacements to their own topic.
pub struct ConsumerWorker {
    processor: EventProcessor,
    writer: Arc<dyn StorageWriter>,
    producer: Arc<dyn MessageProducer>,
    replacements_topic: String,
    producer_flush_timeout: Duration,
}

impl ConsumerWorker {
    pub fn new(
        config: &WorkerConfig,
        writer: Arc<dyn StorageWriter>,
        producer: Arc<dyn MessageProducer>,
    ) -> Self {
        Self {
            processor: EventProcessor::new(
                config.max_event_age_days(),
                config.default_retention_days(),
            ),
            writer,
            producer,
            replacements_topic: config.replacements_topic().to_string(),
            producer_flush_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_producer_flush_timeout(mut self, timeout: Duration) -> Self {
        self.producer_flush_timeout = timeout;
        self
    }

    async fn write_inserts(&self, inserts: Vec<EventRow>) -> Result<(), FlushError> {
        let count = inserts.len();
        let start = Instant::now();
        self.writer.write(&inserts).await?;

        histogram!(INSERT_DURATION_MS).record(start.elapsed().as_millis() as f64);
        histogram!(INSERTS).record(count as f64);
        Ok(())
    }

    async fn produce_replacements(&self, replacements: Vec<Replacement>) -> Result<(), FlushError> {
        let records = replacements
            .into_iter()
            .map(|replacement| {
                let payload = serde_json::to_vec(&replacement.record)?;
                Ok(KafkaRecord::new(Some(replacement.key.into_bytes()), payload))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let produced = self
            .producer
            .produce_all(&self.replacements_topic, records)
            .await?;
        counter!(REPLACEMENTS_PRODUCED).increment(produced as u64);
        Ok(())
    }
}

#[async_trait]
impl Worker for ConsumerWorker {
    type Output = ProcessedMessage;

    fn process_message(
        &self,
        message: &StreamMessage,
    ) -> Result<Option<ProcessedMessage>, ProcessingError> {
        self.processor
            .process(&message.value, message.metadata())
            .inspect_err(|e| {
                let reason = if e.is_invalid_action() {
                    "invalid_action"
                } else {
                    "invalid_message"
                };
                counter!(PROCESSING_ERRORS, "reason" => reason).increment(1);
            })
    }

    /// Inserts go out as one write, then replacements in batch order. Either
    /// failing fails the flush.
    async fn flush_batch(&self, batch: Vec<ProcessedMessage>) -> Result<(), FlushError> {
        let mut inserts = Vec::new();
        let mut replacements = Vec::new();
        for message in batch {
            match message {
                ProcessedMessage::Insert(rows) => inserts.extend(rows),
                ProcessedMessage::Replace(pairs) => replacements.extend(pairs),
            }
        }

        if !inserts.is_empty() {
            self.write_inserts(inserts).await?;
        }
        if !replacements.is_empty() {
            self.produce_replacements(replacements).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        match self.producer.flush(self.producer_flush_timeout).await {
            Ok(()) => info!("Replacement producer flushed"),
            Err(e) => error!("Failed to flush replacement producer: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_utils::{MemoryProducer, RecordingWriter};

    fn worker(writer: Arc<RecordingWriter>, producer: Arc<MemoryProducer>) -> ConsumerWorker {
        let config = WorkerConfig::new("event-replacements", 90).expect("valid config");
        ConsumerWorker::new(&config, writer, producer)
    }

    fn row(event_id: &str, offset: u64) -> EventRow {
        EventRow {
            project_id: 1,
            event_id: event_id.to_string(),
            group_id: 0,
            timestamp: 1_717_243_200,
            received: 1_717_243_200,
            platform: "python".to_string(),
            message: String::new(),
            primary_hash: String::new(),
            retention_days: 90,
            data: "{}".to_string(),
            deleted: 0,
            offset,
            partition: 0,
        }
    }

    #[tokio::test]
    async fn replacements_only_skip_storage() {
        let writer = Arc::new(RecordingWriter::new());
        let producer = Arc::new(MemoryProducer::new());
        let worker = worker(writer.clone(), producer.clone());

        worker
            .flush_batch(vec![
                ProcessedMessage::Replace(vec![Replacement::new("1", json!({"project_id": 1}))]),
                ProcessedMessage::Replace(vec![Replacement::new("2", json!({"project_id": 2}))]),
            ])
            .await
            .expect("flush succeeds");

        assert!(writer.writes().is_empty());
        let produced = producer.produced("event-replacements");
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0].key.as_deref(), Some(b"1".as_slice()));
        assert_eq!(produced[0].payload, br#"{"project_id":1}"#);
        assert_eq!(produced[1].key.as_deref(), Some(b"2".as_slice()));
        assert_eq!(produced[1].payload, br#"{"project_id":2}"#);
        assert!(produced.iter().all(|record| record.headers.is_empty()));
    }

    #[tokio::test]
    async fn inserts_are_written_in_one_call() {
        let writer = Arc::new(RecordingWriter::new());
        let producer = Arc::new(MemoryProducer::new());
        let worker = worker(writer.clone(), producer.clone());

        worker
            .flush_batch(vec![
                ProcessedMessage::Insert(vec![row("a", 1)]),
                ProcessedMessage::Replace(vec![Replacement::new("1", json!({"project_id": 1}))]),
                ProcessedMessage::Insert(vec![row("b", 3)]),
            ])
            .await
            .expect("flush succeeds");

        assert_eq!(writer.writes(), vec![vec![row("a", 1), row("b", 3)]]);
        assert_eq!(producer.produced("event-replacements").len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let writer = Arc::new(RecordingWriter::new());
        let producer = Arc::new(MemoryProducer::new());
        let worker = worker(writer.clone(), producer.clone());

        worker.flush_batch(Vec::new()).await.expect("no-op");

        assert!(writer.writes().is_empty());
        assert_eq!(producer.produce_calls(), 0);
    }

    #[tokio::test]
    async fn storage_failure_stops_before_replacements() {
        let writer = Arc::new(RecordingWriter::new());
        writer.fail_writes(true);
        let producer = Arc::new(MemoryProducer::new());
        let worker = worker(writer.clone(), producer.clone());

        let result = worker
            .flush_batch(vec![
                ProcessedMessage::Insert(vec![row("a", 1)]),
                ProcessedMessage::Replace(vec![Replacement::new("1", json!({"project_id": 1}))]),
            ])
            .await;

        assert!(matches!(result, Err(FlushError::Storage(_))));
        assert!(producer.produced("event-replacements").is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_fails_the_flush() {
        let writer = Arc::new(RecordingWriter::new());
        let producer = Arc::new(MemoryProducer::new());
        producer.fail_topic("event-replacements");
        let worker = worker(writer.clone(), producer.clone());

        let result = worker
            .flush_batch(vec![ProcessedMessage::Replace(vec![Replacement::new(
                "1",
                json!({"project_id": 1}),
            )])])
            .await;

        assert!(matches!(result, Err(FlushError::ReplacementDelivery(_))));
    }

    #[tokio::test]
    async fn shutdown_flushes_the_producer() {
        let writer = Arc::new(RecordingWriter::new());
        let producer = Arc::new(MemoryProducer::new());
        let worker = worker(writer, producer.clone());

        worker.shutdown().await;
        assert_eq!(producer.flush_calls(), 1);
    }

    #[test]
    fn process_message_attaches_position() {
        let writer = Arc::new(RecordingWriter::new());
        let producer = Arc::new(MemoryProducer::new());
        let worker = worker(writer, producer);

        let now = chrono::Utc::now().to_rfc3339();
        let payload = json!([0, "insert", {"project_id": 3, "event_id": "e1", "datetime": now}]);
        let message = StreamMessage::new("events", 4, 99, payload.to_string().into_bytes());

        let Some(ProcessedMessage::Insert(rows)) =
            worker.process_message(&message).expect("valid message")
        else {
            panic!("expected an insert");
        };
        assert_eq!(rows[0].offset, 99);
        assert_eq!(rows[0].partition, 4);
        assert_eq!(rows[0].project_id, 3);
    }

    #[test]
    fn rows_get_the_configured_default_retention() {
        let config = WorkerConfig::new("event-replacements", 300)
            .and_then(|config| config.with_default_retention_days(30))
            .expect("valid config");
        let worker = ConsumerWorker::new(
            &config,
            Arc::new(RecordingWriter::new()),
            Arc::new(MemoryProducer::new()),
        );

        let now = chrono::Utc::now().to_rfc3339();
        let payload = json!([2, "insert", {"project_id": 3, "event_id": "e1", "datetime": now}]);
        let message = StreamMessage::new("events", 0, 1, payload.to_string().into_bytes());

        let Some(ProcessedMessage::Insert(rows)) =
            worker.process_message(&message).expect("valid message")
        else {
            panic!("expected an insert");
        };
        assert_eq!(rows[0].retention_days, 30);
    }
}
