//! Hook descriptors: reusable behaviours published to a marketplace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle phase of the assistant that a hook can fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HookPhase {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Notification,
    Stop,
    SubagentStop,
    PreCompact,
    SessionStart,
    SessionEnd,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::PreToolUse => "PreToolUse",
            HookPhase::PostToolUse => "PostToolUse",
            HookPhase::UserPromptSubmit => "UserPromptSubmit",
            HookPhase::Notification => "Notification",
            HookPhase::Stop => "Stop",
            HookPhase::SubagentStop => "SubagentStop",
            HookPhase::PreCompact => "PreCompact",
            HookPhase::SessionStart => "SessionStart",
            HookPhase::SessionEnd => "SessionEnd",
        }
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PreToolUse" => Ok(HookPhase::PreToolUse),
            "PostToolUse" => Ok(HookPhase::PostToolUse),
            "UserPromptSubmit" => Ok(HookPhase::UserPromptSubmit),
            "Notification" => Ok(HookPhase::Notification),
            "Stop" => Ok(HookPhase::Stop),
            "SubagentStop" => Ok(HookPhase::SubagentStop),
            "PreCompact" => Ok(HookPhase::PreCompact),
            "SessionStart" => Ok(HookPhase::SessionStart),
            "SessionEnd" => Ok(HookPhase::SessionEnd),
            _ => Err(format!("Unknown hook phase: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDocumentation {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub best_practices: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookValidation {
    #[serde(default)]
    pub required_context: Vec<String>,
    #[serde(default)]
    pub prohibited_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceInfo {
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub rating: f64,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub updated_at: i64,
}

/// A hook descriptor. `name` is unique across the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// Empty when a producer left it for the ingesting side to assign.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub triggers: BTreeSet<HookPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_query: Option<String>,
    #[serde(default)]
    pub documentation: HookDocumentation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<HookValidation>,
    #[serde(default)]
    pub author: HookAuthor,
    #[serde(default)]
    pub marketplace: MarketplaceInfo,
}

impl Hook {
    /// Create a hook with the given identity and no triggers.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "0.1.0".to_string(),
            ..Default::default()
        }
    }

    pub fn fires_on(&self, phase: HookPhase) -> bool {
        self.triggers.contains(&phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_phase_roundtrip_names() {
        for phase in [HookPhase::PreToolUse, HookPhase::SessionEnd, HookPhase::PreCompact] {
            assert_eq!(phase.as_str().parse::<HookPhase>().unwrap(), phase);
        }
        assert!("pre_tool_use".parse::<HookPhase>().is_err());
    }

    #[test]
    fn test_hook_minimal_payload() {
        let hook: Hook = serde_json::from_value(serde_json::json!({
            "name": "lint-before-commit",
            "triggers": ["PreToolUse", "PreToolUse", "Stop"],
            "marketplace": {"downloads": 12}
        }))
        .unwrap();

        assert!(hook.id.is_empty());
        assert_eq!(hook.triggers.len(), 2);
        assert!(hook.fires_on(HookPhase::Stop));
        assert_eq!(hook.marketplace.downloads, 12);
        assert!(hook.validation.is_none());
    }
}
