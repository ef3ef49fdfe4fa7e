use clickhouse::Row;
use serde::{Deserialize, Serialize};

/// One row of the events table.
#[derive(Row, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub project_id: u64,
    pub event_id: String,
    pub group_id: u64,
    // DateTime columns, seconds since the epoch
    pub timestamp: u32,
    pub received: u32,
    pub platform: String,
    pub message: String,
    pub primary_hash: String,
    pub retention_days: u16,
    pub data: String,
    pub deleted: u8,
    pub offset: u64,
    pub partition: u16,
}
