use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{EventAction, EventRow, ProcessedMessage, Replacement};
use crate::error::ProcessingError;
use crate::types::MessageMetadata;

const SUPPORTED_VERSIONS: &[i64] = &[0, 1, 2];

#[derive(Debug, Deserialize)]
struct InsertEvent {
    project_id: u64,
    event_id: String,
    #[serde(default)]
    group_id: Option<u64>,
    datetime: String,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    primary_hash: Option<String>,
    #[serde(default)]
    retention_days: Option<u16>,
    #[serde(default)]
    data: Value,
}

/// Decodes `[version, action, body]` payloads into rows or replacements.
#[derive(Debug, Clone)]
pub struct EventProcessor {
    max_event_age: Duration,
    default_retention_days: u16,
}

impl EventProcessor {
    /// `default_retention_days` applies to rows whose event carries no
    /// `retention_days` of its own.
    pub fn new(max_event_age_days: u32, default_retention_days: u16) -> Self {
        Self {
            max_event_age: Duration::days(i64::from(max_event_age_days)),
            default_retention_days,
        }
    }

    pub fn process(
        &self,
        payload: &[u8],
        metadata: MessageMetadata,
    ) -> Result<Option<ProcessedMessage>, ProcessingError> {
        self.process_at(payload, metadata, Utc::now())
    }

    /// `Ok(None)` for events older than the retention cutoff relative to `now`.
    pub fn process_at(
        &self,
        payload: &[u8],
        metadata: MessageMetadata,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessedMessage>, ProcessingError> {
        let (version, action, body): (i64, String, Value) = serde_json::from_slice(payload)?;

        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ProcessingError::UnsupportedVersion(version));
        }

        let action: EventAction = action.parse()?;
        if action.is_replacement() {
            let key = body
                .get("project_id")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    ProcessingError::InvalidEvent(format!("{action} without a project_id"))
                })?;
            let record = json!([version, action.as_str(), body]);
            return Ok(Some(ProcessedMessage::Replace(vec![Replacement::new(
                key.to_string(),
                record,
            )])));
        }

        let event: InsertEvent = serde_json::from_value(body)
            .map_err(|e| ProcessingError::InvalidEvent(e.to_string()))?;

        let event_time = DateTime::parse_from_rfc3339(&event.datetime)
            .map_err(|e| {
                ProcessingError::InvalidEvent(format!("bad datetime {:?}: {e}", event.datetime))
            })?
            .with_timezone(&Utc);

        if now.signed_duration_since(event_time) > self.max_event_age {
            return Ok(None);
        }

        self.insert_row(event, event_time, metadata)
            .map(|row| Some(ProcessedMessage::Insert(vec![row])))
    }

    fn insert_row(
        &self,
        event: InsertEvent,
        event_time: DateTime<Utc>,
        metadata: MessageMetadata,
    ) -> Result<EventRow, ProcessingError> {
        let timestamp = epoch_seconds(event_time.timestamp())?;
        let received = match event.data.get("received").and_then(Value::as_i64) {
            Some(received) => epoch_seconds(received)?,
            None => timestamp,
        };

        Ok(EventRow {
            project_id: event.project_id,
            event_id: event.event_id,
            group_id: event.group_id.unwrap_or(0),
            timestamp,
            received,
            platform: event.platform.unwrap_or_default(),
            message: event.message.unwrap_or_default(),
            primary_hash: event.primary_hash.unwrap_or_default(),
            retention_days: event.retention_days.unwrap_or(self.default_retention_days),
            data: event.data.to_string(),
            deleted: 0,
            offset: u64::try_from(metadata.offset).map_err(|_| {
                ProcessingError::InvalidEvent(format!("negative offset {}", metadata.offset))
            })?,
            partition: u16::try_from(metadata.partition).map_err(|_| {
                ProcessingError::InvalidEvent(format!("partition {} out of range", metadata.partition))
            })?,
        })
    }
}

fn epoch_seconds(seconds: i64) -> Result<u32, ProcessingError> {
    u32::try_from(seconds)
        .map_err(|_| ProcessingError::InvalidEvent(format!("timestamp {seconds} out of range")))
}
