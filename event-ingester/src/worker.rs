use async_trait::async_trait;

use crate::error::{FlushError, ProcessingError};
use crate::types::StreamMessage;

/// What the batching consumer drives.
///
/// `process_message` runs once per polled message and decides what, if
/// anything, goes into the batch. `flush_batch` receives everything accepted
/// since the last flush, and only returns once its effects are durable: the
/// consumer commits offsets right after it succeeds.
#[async_trait]
pub trait Worker: Send + Sync {
    type Output: Send;

    /// `Ok(None)` drops the message without affecting the batch.
    fn process_message(&self, message: &StreamMessage)
        -> Result<Option<Self::Output>, ProcessingError>;

    async fn flush_batch(&self, batch: Vec<Self::Output>) -> Result<(), FlushError>;

    async fn shutdown(&self);
}
