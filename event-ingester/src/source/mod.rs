use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::types::{Partition, StreamMessage};

pub mod kafka;

pub use self::kafka::KafkaStreamSource;

/// A poll-based view over a partitioned log.
#[async_trait]
pub trait StreamSource: Send {
    /// Wait at most `timeout` for the next message. `Ok(None)` means nothing
    /// arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<StreamMessage>, SourceError>;

    fn assignment(&self) -> Result<BTreeSet<Partition>, SourceError>;

    /// Commit the given next-to-read offsets. Returns once the commit is durable.
    async fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), SourceError>;

    async fn close(&mut self);
}
