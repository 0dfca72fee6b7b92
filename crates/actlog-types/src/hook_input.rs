//! The JSON the assistant's hook runner writes to a hook command's stdin.
//!
//! Producers adapt this into a [`TransactionDraft`]; the core pipeline only
//! ever sees drafts.

use crate::{
    ContextDraft, FileRef, HookPhase, Prompt, PromptDraft, PromptType, ResultDraft,
    TransactionDraft, TransactionMetadata,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Environment key under which the assistant's own session id is kept.
pub const ASSISTANT_SESSION_ENV: &str = "ASSISTANT_SESSION_ID";

/// Hook stdin payload. Only `hook_event_name` is required.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HookInput {
    /// The assistant's session id.
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(alias = "hookEventName")]
    pub hook_event_name: String,

    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default, alias = "transcriptPath")]
    pub transcript_path: Option<String>,

    #[serde(default, alias = "permissionMode")]
    pub permission_mode: Option<String>,

    // PreToolUse / PostToolUse
    #[serde(default)]
    pub tool_name: Option<String>,

    #[serde(default)]
    pub tool_input: Option<Value>,

    #[serde(default)]
    pub tool_response: Option<Value>,

    #[serde(default)]
    pub tool_use_id: Option<String>,

    // UserPromptSubmit
    #[serde(default)]
    pub prompt: Option<String>,

    // SessionStart / SessionEnd
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub reason: Option<String>,

    // Notification
    #[serde(default)]
    pub message: Option<String>,
}

impl HookInput {
    pub fn phase(&self) -> Option<HookPhase> {
        self.hook_event_name.parse().ok()
    }

    /// Short description of a tool call, e.g. `Bash: cargo fmt`.
    pub fn tool_summary(&self) -> String {
        let tool = self.tool_name.as_deref().unwrap_or("unknown");
        let detail = self.tool_input.as_ref().and_then(|input| {
            ["command", "file_path", "pattern", "path", "url", "description", "prompt"]
                .iter()
                .find_map(|key| input.get(*key).and_then(Value::as_str))
                .map(str::to_string)
        });
        match detail {
            Some(detail) => format!("{}: {}", tool, detail),
            None => tool.to_string(),
        }
    }

    fn file_refs(&self) -> Vec<FileRef> {
        self.tool_input
            .as_ref()
            .and_then(|input| {
                input
                    .get("file_path")
                    .or_else(|| input.get("notebook_path"))
                    .and_then(Value::as_str)
            })
            .map(|path| {
                vec![FileRef {
                    path: path.to_string(),
                    hash: None,
                }]
            })
            .unwrap_or_default()
    }

    /// Extract `(output, error)` from a tool response.
    fn response_text(&self) -> (Option<String>, Option<String>) {
        let Some(response) = &self.tool_response else {
            return (None, None);
        };

        let is_error = response
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let error = response
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| is_error.then(|| "tool reported an error".to_string()));

        let output = match response {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => ["output", "stdout", "content", "result"]
                .iter()
                .find_map(|key| other.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .or_else(|| Some(other.to_string())),
        };

        (output, error)
    }

    /// Adapt this hook input into a transaction draft.
    pub fn to_draft(&self) -> TransactionDraft {
        let phase = self.phase();
        let tool = self.tool_name.clone();

        let prompt = match phase {
            Some(HookPhase::UserPromptSubmit) => Prompt {
                raw: self.prompt.clone().unwrap_or_default(),
                kind: PromptType::User,
            },
            Some(HookPhase::PreToolUse) | Some(HookPhase::PostToolUse) => Prompt {
                raw: self.tool_summary(),
                kind: PromptType::Tool,
            },
            _ => {
                let detail = self
                    .reason
                    .as_deref()
                    .or(self.source.as_deref())
                    .or(self.message.as_deref());
                Prompt {
                    raw: match detail {
                        Some(detail) => format!("{}: {}", self.hook_event_name, detail),
                        None => self.hook_event_name.clone(),
                    },
                    kind: PromptType::System,
                }
            }
        };

        let (output, error) = if phase == Some(HookPhase::PostToolUse) {
            self.response_text()
        } else {
            (None, None)
        };

        let mut environment = std::collections::BTreeMap::new();
        if let Some(session_id) = &self.session_id {
            environment.insert(ASSISTANT_SESSION_ENV.to_string(), session_id.clone());
        }

        let mut metadata = TransactionMetadata {
            category: Some(self.hook_event_name.clone()),
            ..Default::default()
        };
        if let Some(tool) = &tool {
            metadata.tags.insert(format!("tool:{}", tool));
        }

        TransactionDraft {
            id: None,
            timestamp: None,
            session_id: self.cwd.clone().or_else(|| self.session_id.clone()),
            prompt: Some(PromptDraft::Full(prompt)),
            context: Some(ContextDraft {
                cwd: self.cwd.clone(),
                platform: None,
                environment,
                tools_available: Vec::new(),
                files: self.file_refs(),
            }),
            result: Some(ResultDraft {
                success: Some(error.is_none()),
                output,
                error,
                duration_ms: None,
                tools_used: tool.into_iter().collect(),
            }),
            metadata: Some(metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_submit_draft() {
        let input: HookInput = serde_json::from_value(serde_json::json!({
            "session_id": "abc",
            "hook_event_name": "UserPromptSubmit",
            "cwd": "/repo",
            "prompt": "add tests"
        }))
        .unwrap();

        let draft = input.to_draft();
        assert_eq!(draft.session_id.as_deref(), Some("/repo"));
        match draft.prompt {
            Some(PromptDraft::Full(p)) => {
                assert_eq!(p.raw, "add tests");
                assert_eq!(p.kind, PromptType::User);
            }
            other => panic!("unexpected prompt: {:?}", other),
        }
        let context = draft.context.unwrap();
        assert_eq!(context.environment.get(ASSISTANT_SESSION_ENV).map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_post_tool_use_error_draft() {
        let input: HookInput = serde_json::from_value(serde_json::json!({
            "hook_event_name": "PostToolUse",
            "tool_name": "Edit",
            "tool_input": {"file_path": "/repo/src/lib.rs"},
            "tool_response": {"is_error": true, "error": "old_string not found"}
        }))
        .unwrap();

        let draft = input.to_draft();
        let result = draft.result.unwrap();
        assert_eq!(result.success, Some(false));
        assert_eq!(result.error.as_deref(), Some("old_string not found"));
        assert_eq!(result.tools_used, vec!["Edit".to_string()]);
        assert_eq!(draft.context.unwrap().files[0].path, "/repo/src/lib.rs");
        assert!(draft.metadata.unwrap().tags.contains("tool:Edit"));
    }

    #[test]
    fn test_tool_summary_prefers_command() {
        let input = HookInput {
            hook_event_name: "PreToolUse".to_string(),
            tool_name: Some("Bash".to_string()),
            tool_input: Some(serde_json::json!({"command": "cargo fmt", "description": "format"})),
            ..Default::default()
        };
        assert_eq!(input.tool_summary(), "Bash: cargo fmt");
    }

    #[test]
    fn test_unknown_event_is_system_prompt() {
        let input = HookInput {
            hook_event_name: "SessionEnd".to_string(),
            reason: Some("logout".to_string()),
            ..Default::default()
        };
        match input.to_draft().prompt {
            Some(PromptDraft::Full(p)) => {
                assert_eq!(p.kind, PromptType::System);
                assert_eq!(p.raw, "SessionEnd: logout");
            }
            other => panic!("unexpected prompt: {:?}", other),
        }
    }
}
