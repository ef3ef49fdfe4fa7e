//! In-memory stand-ins for the consumer's collaborators, shared by the unit
//! tests and the integration tests under `tests/`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_producer::KafkaRecord;
use tokio_util::sync::CancellationToken;

use crate::error::{FlushError, ProcessingError, ProduceError, SourceError, StorageError};
use crate::events::EventRow;
use crate::producer::MessageProducer;
use crate::source::StreamSource;
use crate::storage::StorageWriter;
use crate::types::{Partition, StreamMessage};
use crate::worker::Worker;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SourceState {
    queue: VecDeque<StreamMessage>,
    assigned: BTreeSet<Partition>,
    commits: Vec<HashMap<Partition, i64>>,
    close_calls: usize,
    fail_commits: bool,
    cancel_when_drained: Option<CancellationToken>,
}

/// A queue of messages. Clones share state, so a test can keep a handle
/// after moving the source into a consumer.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message. Its partition counts as assigned from then on.
    pub fn push(&self, message: StreamMessage) {
        let mut state = lock(&self.state);
        state.assigned.insert(message.partition());
        state.queue.push_back(message);
    }

    /// Cancel `token` the first time a poll finds the queue empty.
    pub fn cancel_when_drained(&self, token: CancellationToken) {
        lock(&self.state).cancel_when_drained = Some(token);
    }

    pub fn fail_commits(&self, fail: bool) {
        lock(&self.state).fail_commits = fail;
    }

    pub fn commits(&self) -> Vec<HashMap<Partition, i64>> {
        lock(&self.state).commits.clone()
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    pub fn remaining(&self) -> usize {
        lock(&self.state).queue.len()
    }
}

#[async_trait]
impl StreamSource for MemorySource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<StreamMessage>, SourceError> {
        let next = {
            let mut state = lock(&self.state);
            if state.close_calls > 0 {
                return Err(SourceError::Closed);
            }
            let next = state.queue.pop_front();
            if next.is_none() {
                if let Some(token) = &state.cancel_when_drained {
                    token.cancel();
                }
            }
            next
        };

        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(next)
    }

    fn assignment(&self) -> Result<BTreeSet<Partition>, SourceError> {
        Ok(lock(&self.state).assigned.clone())
    }

    async fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), SourceError> {
        let mut state = lock(&self.state);
        if state.fail_commits {
            return Err(SourceError::Closed);
        }
        state.commits.push(offsets.clone());
        Ok(())
    }

    async fn close(&mut self) {
        lock(&self.state).close_calls += 1;
    }
}

/// Records everything produced, per topic, and fails on demand.
#[derive(Default)]
pub struct MemoryProducer {
    produced: Mutex<Vec<(String, KafkaRecord)>>,
    failing_topics: Mutex<HashSet<String>>,
    produce_calls: AtomicUsize,
    flush_calls: AtomicUsize,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_topic(&self, topic: &str) {
        lock(&self.failing_topics).insert(topic.to_string());
    }

    pub fn produced(&self, topic: &str) -> Vec<KafkaRecord> {
        lock(&self.produced)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Every record in publish order, with its topic.
    pub fn all_produced(&self) -> Vec<(String, KafkaRecord)> {
        lock(&self.produced).clone()
    }

    pub fn produce_calls(&self) -> usize {
        self.produce_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn produce_all(
        &self,
        topic: &str,
        records: Vec<KafkaRecord>,
    ) -> Result<usize, ProduceError> {
        self.produce_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_topics).contains(topic) {
            return Err(ProduceError::Delivery {
                topic: topic.to_string(),
                reason: "broker rejected the message".to_string(),
            });
        }

        let count = records.len();
        lock(&self.produced).extend(records.into_iter().map(|r| (topic.to_string(), r)));
        Ok(count)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ProduceError> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Storage writer that keeps every write in memory.
#[derive(Default)]
pub struct RecordingWriter {
    writes: Mutex<Vec<Vec<EventRow>>>,
    fail: AtomicBool,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Vec<EventRow>> {
        lock(&self.writes).clone()
    }
}

#[async_trait]
impl StorageWriter for RecordingWriter {
    async fn write(&self, rows: &[EventRow]) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("connection refused".to_string()));
        }
        lock(&self.writes).push(rows.to_vec());
        Ok(())
    }
}

/// Worker whose output is the message offset.
///
/// Payload `drop` is dropped, `bad` fails processing and `unknown-action`
/// fails with an invalid action. Everything else is accepted.
#[derive(Default)]
pub struct FakeWorker {
    processed: Mutex<Vec<i64>>,
    flushed: Mutex<Vec<Vec<i64>>>,
    shutdown_calls: AtomicUsize,
    fail_flushes: AtomicBool,
    fail_processing: AtomicBool,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::SeqCst);
    }

    /// Fail every message, whatever its payload.
    pub fn fail_processing(&self, fail: bool) {
        self.fail_processing.store(fail, Ordering::SeqCst);
    }

    pub fn processed(&self) -> Vec<i64> {
        lock(&self.processed).clone()
    }

    pub fn flushed(&self) -> Vec<Vec<i64>> {
        lock(&self.flushed).clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FakeWorker {
    type Output = i64;

    fn process_message(&self, message: &StreamMessage) -> Result<Option<i64>, ProcessingError> {
        lock(&self.processed).push(message.offset);
        if self.fail_processing.load(Ordering::SeqCst) {
            return Err(ProcessingError::InvalidEvent("division by zero".to_string()));
        }
        match message.value.as_slice() {
            b"drop" => Ok(None),
            b"bad" => Err(ProcessingError::InvalidEvent("unparseable".to_string())),
            b"unknown-action" => Err(ProcessingError::InvalidActionType("unknown".to_string())),
            _ => Ok(Some(message.offset)),
        }
    }

    async fn flush_batch(&self, batch: Vec<i64>) -> Result<(), FlushError> {
        if self.fail_flushes.load(Ordering::SeqCst) {
            return Err(FlushError::Storage(StorageError::Unavailable(
                "connection refused".to_string(),
            )));
        }
        lock(&self.flushed).push(batch);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }
}
