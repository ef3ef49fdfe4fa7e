use std::fmt;
use std::str::FromStr;

use crate::error::ProcessingError;

/// The discriminator carried in the second slot of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Insert,
    StartDeleteGroups,
    StartMerge,
    StartUnmerge,
    StartDeleteTag,
    EndDeleteGroups,
    EndMerge,
    EndUnmerge,
    EndDeleteTag,
    TombstoneEvents,
    ExcludeGroups,
    ReplaceGroup,
}

const ACTIONS: &[(&str, EventAction)] = &[
    ("insert", EventAction::Insert),
    ("start_delete_groups", EventAction::StartDeleteGroups),
    ("start_merge", EventAction::StartMerge),
    ("start_unmerge", EventAction::StartUnmerge),
    ("start_delete_tag", EventAction::StartDeleteTag),
    ("end_delete_groups", EventAction::EndDeleteGroups),
    ("end_merge", EventAction::EndMerge),
    ("end_unmerge", EventAction::EndUnmerge),
    ("end_delete_tag", EventAction::EndDeleteTag),
    ("tombstone_events", EventAction::TombstoneEvents),
    ("exclude_groups", EventAction::ExcludeGroups),
    ("replace_group", EventAction::ReplaceGroup),
];

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        ACTIONS
            .iter()
            .find(|(_, action)| action == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Everything but inserts is forwarded to the replacements topic.
    pub fn is_replacement(&self) -> bool {
        !matches!(self, EventAction::Insert)
    }
}

impl FromStr for EventAction {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ACTIONS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, action)| *action)
            .ok_or_else(|| ProcessingError::InvalidActionType(s.to_string()))
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
