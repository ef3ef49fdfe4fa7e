use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::StreamSource;
use crate::error::SourceError;
use crate::metrics_consts::KAFKA_CONSUMER_ERROR;
use crate::types::{Partition, StreamMessage};

/// [`StreamSource`] over a subscribed rdkafka consumer with manual commits.
pub struct KafkaStreamSource {
    consumer: StreamConsumer,
    consecutive_errors: u64,
    closed: bool,
}

impl KafkaStreamSource {
    /// The consumer must have auto commit and auto offset store disabled,
    /// as `common_kafka::kafka_consumer::create_kafka_consumer` does.
    pub fn new(consumer: StreamConsumer) -> Self {
        Self {
            consumer,
            consecutive_errors: 0,
            closed: false,
        }
    }
}

/// What a failed `recv()` means for the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollFailure {
    /// Nothing to read right now; the next poll will try again.
    Idle(&'static str),
    /// The broker connection is degraded. Wait before polling again.
    Backoff(&'static str, Duration),
    /// The consumer can't recover.
    Fatal(&'static str),
}

impl PollFailure {
    fn classify(e: &KafkaError, consecutive: u64) -> Self {
        let steps = consecutive.min(10) as u32;
        match e {
            KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => {
                Self::Idle("partition_eof")
            }
            KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut) => {
                Self::Idle("op_timed_out")
            }
            KafkaError::MessageConsumption(_) => {
                Self::Backoff("consumer", Duration::from_millis(100) * steps)
            }
            KafkaError::Global(
                RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure,
            ) => Self::Backoff("broker_down", Duration::from_millis(500) * steps),
            KafkaError::Global(RDKafkaErrorCode::Authentication) => Self::Fatal("authentication"),
            KafkaError::MessageConsumptionFatal(_) => Self::Fatal("consumer"),
            KafkaError::Canceled => Self::Fatal("canceled"),
            _ => Self::Backoff("unexpected", Duration::from_millis(100) * steps),
        }
    }

    fn record(&self, e: &KafkaError) {
        let (level, kind) = match *self {
            Self::Idle(kind) => ("info", kind),
            Self::Backoff(kind, delay) => {
                warn!(?delay, "Kafka consumer error ({kind}): {e}");
                ("warn", kind)
            }
            Self::Fatal(kind) => {
                error!("Kafka consumer cannot continue ({kind}): {e}");
                ("fatal", kind)
            }
        };
        metrics::counter!(KAFKA_CONSUMER_ERROR, "level" => level, "error" => kind).increment(1);
    }
}

#[async_trait]
impl StreamSource for KafkaStreamSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<StreamMessage>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }

        // Borrowed messages can't be held across an await, so copy out right away
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => return Ok(None),
            Ok(received) => received.map(|message| StreamMessage::from_borrowed_message(&message)),
        };

        match received {
            Ok(message) => {
                self.consecutive_errors = 0;
                Ok(Some(message))
            }
            Err(e) => {
                self.consecutive_errors += 1;
                let failure = PollFailure::classify(&e, self.consecutive_errors);
                failure.record(&e);
                match failure {
                    PollFailure::Idle(_) => Ok(None),
                    PollFailure::Backoff(_, delay) => {
                        sleep(delay).await;
                        Ok(None)
                    }
                    PollFailure::Fatal(_) => Err(SourceError::Kafka(e)),
                }
            }
        }
    }

    fn assignment(&self) -> Result<BTreeSet<Partition>, SourceError> {
        let assignment = self.consumer.assignment()?;
        Ok(assignment.elements().into_iter().map(Partition::from).collect())
    }

    async fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )?;
        }

        // Sync, so a successful return means the broker has the position
        self.consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.consumer.unsubscribe();
        self.closed = true;
        info!("Kafka consumer unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_partition_and_timeouts_are_idle() {
        let eof = KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF);
        assert_eq!(
            PollFailure::classify(&eof, 3),
            PollFailure::Idle("partition_eof")
        );
        assert_eq!(
            PollFailure::classify(
                &KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut),
                1
            ),
            PollFailure::Idle("op_timed_out")
        );
    }

    #[test]
    fn broker_outages_back_off_up_to_a_cap() {
        let down = KafkaError::Global(RDKafkaErrorCode::AllBrokersDown);
        assert_eq!(
            PollFailure::classify(&down, 1),
            PollFailure::Backoff("broker_down", Duration::from_millis(500))
        );
        assert_eq!(
            PollFailure::classify(&down, 50),
            PollFailure::Backoff("broker_down", Duration::from_secs(5))
        );
    }

    #[test]
    fn unrecoverable_errors_are_fatal() {
        assert_eq!(
            PollFailure::classify(&KafkaError::Global(RDKafkaErrorCode::Authentication), 1),
            PollFailure::Fatal("authentication")
        );
        assert_eq!(
            PollFailure::classify(
                &KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
                1
            ),
            PollFailure::Fatal("consumer")
        );
        assert_eq!(
            PollFailure::classify(&KafkaError::Canceled, 1),
            PollFailure::Fatal("canceled")
        );
    }
}
