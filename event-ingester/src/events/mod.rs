use serde_json::Value;

pub mod action;
pub mod processor;
pub mod row;

pub use action::EventAction;
pub use processor::EventProcessor;
pub use row::EventRow;

/// A mutation to be republished, keyed so that everything for one project
/// lands in the same partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub key: String,
    pub record: Value,
}

impl Replacement {
    pub fn new(key: impl Into<String>, record: Value) -> Self {
        Self {
            key: key.into(),
            record,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessedMessage {
    Insert(Vec<EventRow>),
    Replace(Vec<Replacement>),
}
