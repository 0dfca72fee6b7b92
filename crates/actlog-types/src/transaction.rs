//! Transaction records: one recorded assistant action.
//!
//! [`Transaction`] is the canonical, fully-populated shape the store persists.
//! [`TransactionDraft`] is the loose shape producers enqueue, where every field
//! may be missing; [`TransactionDraft::finalize`] fills the gaps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Who originated a prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptType {
    #[default]
    User,
    Tool,
    System,
}

impl PromptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptType::User => "user",
            PromptType::Tool => "tool",
            PromptType::System => "system",
        }
    }

    /// Parse the stored form, falling back to `User` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "tool" => PromptType::Tool,
            "system" => PromptType::System,
            _ => PromptType::User,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub raw: String,
    #[serde(rename = "type", default)]
    pub kind: PromptType,
}

/// A file touched by or relevant to the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Environment the action ran in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    pub cwd: String,
    pub platform: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tools_available: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

/// Outcome of the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetadata {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub related_hooks: Vec<String>,
}

/// One recorded action. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique across the store.
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Grouping key, usually the working directory. Not unique.
    pub session_id: String,
    pub prompt: Prompt,
    pub context: TransactionContext,
    pub result: TransactionResult,
    #[serde(default)]
    pub metadata: TransactionMetadata,
}

impl Transaction {
    /// Build a minimal transaction for in-process callers.
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: crate::now_ms(),
            session_id: session_id.into(),
            prompt: Prompt {
                raw: prompt.into(),
                kind: PromptType::User,
            },
            context: TransactionContext {
                platform: std::env::consts::OS.to_string(),
                ..Default::default()
            },
            result: TransactionResult {
                success: true,
                ..Default::default()
            },
            metadata: TransactionMetadata::default(),
        }
    }
}

/// `prompt` as producers may send it: bare text or the full object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptDraft {
    Text(String),
    Full(Prompt),
}

impl From<PromptDraft> for Prompt {
    fn from(draft: PromptDraft) -> Self {
        match draft {
            PromptDraft::Text(raw) => Prompt {
                raw,
                kind: PromptType::User,
            },
            PromptDraft::Full(prompt) => prompt,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_available: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
}

/// Producer-side transaction. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptDraft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextDraft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultDraft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TransactionMetadata>,
}

/// Values the ingesting side supplies for fields a draft left out.
#[derive(Debug, Clone)]
pub struct DraftFallbacks {
    pub id: String,
    pub timestamp: i64,
    pub platform: String,
}

/// Session key used when neither the draft nor its context names one.
pub const DEFAULT_SESSION_ID: &str = "default";

impl TransactionDraft {
    /// Produce a canonical transaction, filling every missing field.
    ///
    /// Blank ids and session ids count as missing.
    pub fn finalize(self, fallbacks: DraftFallbacks) -> Transaction {
        let context = self.context.unwrap_or_default();
        let cwd = context.cwd.unwrap_or_default();

        let session_id = self
            .session_id
            .filter(|s| !s.trim().is_empty())
            .or_else(|| (!cwd.is_empty()).then(|| cwd.clone()))
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());

        let result = self.result.unwrap_or_default();
        let success = result.success.unwrap_or(result.error.is_none());

        Transaction {
            id: self
                .id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(fallbacks.id),
            timestamp: self.timestamp.unwrap_or(fallbacks.timestamp),
            session_id,
            prompt: self.prompt.map(Prompt::from).unwrap_or_default(),
            context: TransactionContext {
                cwd,
                platform: context.platform.unwrap_or(fallbacks.platform),
                environment: context.environment,
                tools_available: context.tools_available,
                files: context.files,
            },
            result: TransactionResult {
                success,
                output: result.output,
                error: result.error,
                duration_ms: result.duration_ms.unwrap_or(0).max(0) as u64,
                tools_used: result.tools_used,
            },
            metadata: self.metadata.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallbacks() -> DraftFallbacks {
        DraftFallbacks {
            id: "fallback-id".to_string(),
            timestamp: 1_700_000_000_000,
            platform: "linux".to_string(),
        }
    }

    #[test]
    fn test_bare_prompt_string_draft() {
        let draft: TransactionDraft =
            serde_json::from_str(r#"{"prompt":"fix bug","result":{"success":true}}"#).unwrap();
        let tx = draft.finalize(fallbacks());

        assert_eq!(tx.id, "fallback-id");
        assert_eq!(tx.timestamp, 1_700_000_000_000);
        assert_eq!(tx.prompt.raw, "fix bug");
        assert_eq!(tx.prompt.kind, PromptType::User);
        assert!(tx.result.success);
        assert_eq!(tx.session_id, DEFAULT_SESSION_ID);
        assert_eq!(tx.context.platform, "linux");
    }

    #[test]
    fn test_full_prompt_and_session_from_cwd() {
        let draft: TransactionDraft = serde_json::from_value(serde_json::json!({
            "prompt": {"raw": "Bash: ls", "type": "tool"},
            "context": {"cwd": "/work/repo", "files": [{"path": "src/main.rs"}]},
            "result": {"error": "exit 1", "durationMs": -5}
        }))
        .unwrap();
        let tx = draft.finalize(fallbacks());

        assert_eq!(tx.prompt.kind, PromptType::Tool);
        assert_eq!(tx.session_id, "/work/repo");
        assert_eq!(tx.context.files[0].path, "src/main.rs");
        assert!(!tx.result.success, "an error without explicit success means failure");
        assert_eq!(tx.result.duration_ms, 0);
    }

    #[test]
    fn test_explicit_fields_win_over_fallbacks() {
        let draft = TransactionDraft {
            id: Some("tx-1".to_string()),
            timestamp: Some(42),
            session_id: Some("s".to_string()),
            ..Default::default()
        };
        let tx = draft.finalize(fallbacks());
        assert_eq!(tx.id, "tx-1");
        assert_eq!(tx.timestamp, 42);
        assert_eq!(tx.session_id, "s");
    }

    #[test]
    fn test_blank_id_is_replaced() {
        let draft = TransactionDraft {
            id: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(draft.finalize(fallbacks()).id, "fallback-id");
    }

    #[test]
    fn test_transaction_wire_names() {
        let tx = Transaction::new("a", "s", "hello");
        let value = serde_json::to_value(&tx).unwrap();
        assert!(value.get("sessionId").is_some());
        assert_eq!(value["prompt"]["type"], "user");
        assert!(value["result"].get("durationMs").is_some());
        assert!(value["context"].get("toolsAvailable").is_some());
    }
}
