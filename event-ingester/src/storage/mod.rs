use async_trait::async_trait;

use crate::error::StorageError;
use crate::events::EventRow;

pub mod clickhouse;

pub use self::clickhouse::ClickHouseWriter;

/// Bulk writer for event rows. A call either stores every row or fails;
/// retries are the caller's problem.
#[async_trait]
pub trait StorageWriter: Send + Sync {
    async fn write(&self, rows: &[EventRow]) -> Result<(), StorageError>;
}
