use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use chrono::Utc;
use event_ingester::config::{BatchingConfig, WorkerConfig};
use event_ingester::consumer::BatchingConsumer;
use event_ingester::consumer_worker::ConsumerWorker;
use event_ingester::error::{ConsumerError, FlushError};
use event_ingester::producer::MessageProducer;
use event_ingester::test_utils::{MemoryProducer, MemorySource, RecordingWriter};
use event_ingester::types::{Partition, StreamMessage};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

struct Harness {
    source: MemorySource,
    writer: Arc<RecordingWriter>,
    producer: Arc<MemoryProducer>,
    consumer: BatchingConsumer<MemorySource, ConsumerWorker>,
}

fn harness(max_batch_size: usize, dead_letter_topic: Option<&str>) -> Harness {
    let source = MemorySource::new();
    let writer = Arc::new(RecordingWriter::new());
    let producer = Arc::new(MemoryProducer::new());
    let shared: Arc<dyn MessageProducer> = producer.clone();

    let worker_config = WorkerConfig::new("event-replacements", 90).expect("valid config");
    let worker = ConsumerWorker::new(&worker_config, writer.clone(), shared.clone());

    let mut builder = BatchingConfig::builder("ingest-consumers")
        .source_topic("events")
        .max_batch_size(max_batch_size)
        .max_batch_time(Duration::from_secs(60))
        .poll_timeout(Duration::from_millis(10))
        .commit_log_topic("events-commit-log");
    if let Some(topic) = dead_letter_topic {
        builder = builder.dead_letter_topic(topic);
    }
    let config = builder.build().expect("valid config");

    let consumer = BatchingConsumer::new(
        source.clone(),
        worker,
        config,
        Some(shared),
        CancellationToken::new(),
    )
    .expect("valid consumer");

    Harness {
        source,
        writer,
        producer,
        consumer,
    }
}

fn insert(offset: i64, event_id: &str, days_old: i64) -> StreamMessage {
    let datetime = (Utc::now() - chrono::Duration::days(days_old)).to_rfc3339();
    let payload = json!([
        2,
        "insert",
        {
            "project_id": 1,
            "event_id": event_id,
            "datetime": datetime,
            "platform": "javascript",
            "data": {"tags": [["browser", "firefox"]]}
        }
    ]);
    StreamMessage::new("events", 0, offset, payload.to_string().into_bytes())
}

fn mutation(offset: i64, action: &str, project_id: u64) -> StreamMessage {
    let payload = json!([2, action, {"project_id": project_id, "group_ids": [4, 5]}]);
    StreamMessage::new("events", 0, offset, payload.to_string().into_bytes())
}

#[tokio::test]
async fn inserts_and_replacements_take_separate_paths() {
    let mut h = harness(3, None);
    h.source.push(insert(0, "a", 0));
    h.source.push(insert(1, "stale", 300));
    h.source.push(mutation(2, "start_merge", 7));
    h.source.push(insert(3, "b", 1));

    for _ in 0..4 {
        h.consumer.run_once().await.expect("run_once");
    }

    let writes = h.writer.writes();
    assert_eq!(writes.len(), 1);
    let event_ids: Vec<_> = writes[0].iter().map(|row| row.event_id.as_str()).collect();
    assert_eq!(event_ids, vec!["a", "b"]);
    assert_eq!(writes[0][1].offset, 3);
    assert_eq!(writes[0][1].partition, 0);

    let replacements = h.producer.produced("event-replacements");
    assert_eq!(replacements.len(), 1);
    assert_eq!(replacements[0].key.as_deref(), Some(b"7".as_slice()));
    let record: Value = serde_json::from_slice(&replacements[0].payload).expect("json");
    assert_json_eq!(
        record,
        json!([2, "start_merge", {"project_id": 7, "group_ids": [4, 5]}])
    );

    assert_eq!(
        h.source.commits(),
        vec![HashMap::from([(Partition::new("events", 0), 4)])]
    );
    let commit_log = h.producer.produced("events-commit-log");
    assert_eq!(commit_log.len(), 1);
    assert_eq!(
        commit_log[0].key.as_deref(),
        Some(b"events:0:ingest-consumers".as_slice())
    );
    assert_eq!(commit_log[0].payload, b"4");
}

#[tokio::test]
async fn replacements_keep_per_key_order() {
    let mut h = harness(4, None);
    h.source.push(mutation(0, "start_unmerge", 1));
    h.source.push(mutation(1, "start_delete_groups", 2));
    h.source.push(mutation(2, "end_unmerge", 1));
    h.source.push(mutation(3, "end_delete_groups", 2));

    for _ in 0..4 {
        h.consumer.run_once().await.expect("run_once");
    }

    assert!(h.writer.writes().is_empty());
    let actions: Vec<(String, String)> = h
        .producer
        .produced("event-replacements")
        .into_iter()
        .map(|record| {
            let key = String::from_utf8(record.key.unwrap_or_default()).expect("utf8 key");
            let value: Value = serde_json::from_slice(&record.payload).expect("json");
            (key, value[1].as_str().unwrap_or_default().to_string())
        })
        .collect();
    assert_eq!(
        actions,
        vec![
            ("1".to_string(), "start_unmerge".to_string()),
            ("2".to_string(), "start_delete_groups".to_string()),
            ("1".to_string(), "end_unmerge".to_string()),
            ("2".to_string(), "end_delete_groups".to_string()),
        ]
    );
}

#[tokio::test]
async fn storage_failure_stops_without_committing() {
    let mut h = harness(2, None);
    h.writer.fail_writes(true);
    h.source.push(insert(0, "a", 0));
    h.source.push(insert(1, "b", 0));

    let err = h.consumer.run().await.unwrap_err();

    assert!(matches!(err, ConsumerError::Flush(FlushError::Storage(_))));
    assert!(h.source.commits().is_empty());
    assert!(h.producer.produced("events-commit-log").is_empty());
    assert_eq!(h.source.close_calls(), 1);
    // the worker flushed its producer on the way out
    assert_eq!(h.producer.flush_calls(), 1);
}

#[tokio::test]
async fn replacement_delivery_failure_stops_without_committing() {
    let mut h = harness(1, None);
    h.producer.fail_topic("event-replacements");
    h.source.push(mutation(0, "end_merge", 3));

    let err = h.consumer.run().await.unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Flush(FlushError::ReplacementDelivery(_))
    ));
    assert!(h.source.commits().is_empty());
}

#[tokio::test]
async fn unknown_action_stops_the_consumer_even_with_a_dead_letter_topic() {
    let mut h = harness(10, Some("events-dlq"));
    h.source.push(insert(0, "a", 0));
    h.source
        .push(StreamMessage::new("events", 0, 1, br#"[2, "explode", {}]"#.to_vec()));

    let err = h.consumer.run().await.unwrap_err();

    assert!(matches!(err, ConsumerError::Processing { offset: 1, .. }));
    assert!(h.writer.writes().is_empty());
    assert!(h.source.commits().is_empty());
    assert!(h.producer.produced("events-dlq").is_empty());
}

#[tokio::test]
async fn malformed_payloads_are_dead_lettered() {
    let mut h = harness(1, Some("events-dlq"));
    h.source
        .push(StreamMessage::new("events", 0, 0, b"{not json".to_vec()).with_key("k"));
    h.source.push(insert(1, "a", 0));

    h.consumer.run_once().await.expect("dead-lettered");
    h.consumer.run_once().await.expect("inserted");

    let dead = h.producer.produced("events-dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, b"{not json");
    assert_eq!(dead[0].key.as_deref(), Some(b"k".as_slice()));
    assert_eq!(h.writer.writes().len(), 1);
    assert_eq!(
        h.source.commits(),
        vec![HashMap::from([(Partition::new("events", 0), 2)])]
    );
}
