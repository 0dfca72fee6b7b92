//! Queue envelope written by producers, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Record kind carried by a queue. Each kind has its own queue file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Transactions,
    Hooks,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Transactions, QueueKind::Hooks];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Transactions => "transactions",
            QueueKind::Hooks => "hooks",
        }
    }

    /// File name producers append to.
    pub fn file_name(&self) -> String {
        format!("{}.jsonl", self.as_str())
    }

    /// File name the consumer renames a queue to while draining it.
    pub fn claim_file_name(&self) -> String {
        format!("{}.draining", self.as_str())
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued event. The payload stays untyped until the consumer reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub kind: QueueKind,
    pub payload: Value,
    /// Milliseconds since the Unix epoch, stamped by the producer.
    pub enqueued_at: i64,
    pub producer_pid: u32,
    /// Client-generated token; becomes the record id when the payload has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_token: Option<String>,
}

impl QueueEntry {
    /// Wrap a payload, stamping time, pid and a fresh dedup token.
    pub fn new(kind: QueueKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            enqueued_at: crate::now_ms(),
            producer_pid: std::process::id(),
            dedup_token: Some(Uuid::new_v4().to_string()),
        }
    }
}
