use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an entry is shown: the reasoning trail or the user-facing response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Reasoning,
    Response,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Loading,
    Completed,
    Failed,
}

/// Snapshot of one tool call as persisted for a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEntry {
    pub id: String,
    pub message_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub title: String,
    pub content: Value,
    #[serde(default)]
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}

impl MessageEntry {
    /// True when two snapshots would render the same, ignoring bookkeeping.
    pub fn same_payload(&self, other: &MessageEntry) -> bool {
        self.kind == other.kind
            && self.status == other.status
            && self.title == other.title
            && self.content == other.content
            && self.tool_name == other.tool_name
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateReceipt {
    pub sequence_number: u64,
    pub skipped: bool,
}
