//! Consultation gate: protected tools are refused until the history has been
//! consulted within the last `ttl`.
//!
//! State lives in a small JSON marker file, written via temp-file + rename and
//! evaluated lazily on every check. Nothing expires it in the background.

use crate::fsutil;
use crate::{ActlogError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_GATE_TTL: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_PROTECTED_TOOLS: [&str; 3] = ["Glob", "Grep", "Task"];

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateMarker {
    /// Milliseconds since the Unix epoch.
    pub consulted_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub pid: u32,
}

/// The call that lifts a refusal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredCall {
    pub operation: String,
    pub arguments: Value,
    pub command: String,
}

/// Structured refusal for a protected tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationRequired {
    pub tool: String,
    pub reason: String,
    pub required_call: RequiredCall,
}

impl ConsultationRequired {
    fn for_tool(tool: &str, ttl: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            reason: format!(
                "{} is blocked until past actions have been consulted (valid for {} s). \
                 Run the consult operation first, then retry.",
                tool,
                ttl.as_secs()
            ),
            required_call: RequiredCall {
                operation: "consult".to_string(),
                arguments: json!({"query": "<what you are looking for>"}),
                command: "actlog consult \"<what you are looking for>\"".to_string(),
            },
        }
    }

    /// The JSON a blocking hook reports. With exit code 2 the assistant only
    /// reads stderr, so that is where it goes.
    pub fn hook_response(&self) -> Value {
        json!({
            "decision": "block",
            "reason": self.reason,
            "requiredCall": self.required_call,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(ConsultationRequired),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct ConsultationGate {
    marker_path: PathBuf,
    ttl: Duration,
    protected_tools: BTreeSet<String>,
}

impl ConsultationGate {
    pub fn new(marker_path: impl Into<PathBuf>) -> Self {
        Self {
            marker_path: marker_path.into(),
            ttl: DEFAULT_GATE_TTL,
            protected_tools: DEFAULT_PROTECTED_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_protected_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_protected(&self, tool: &str) -> bool {
        self.protected_tools.contains(tool)
    }

    /// Record a consultation now.
    pub fn mark_consulted(&self, query: Option<&str>) -> Result<GateMarker> {
        self.mark_consulted_at(query, actlog_types::now_ms())
    }

    pub fn mark_consulted_at(&self, query: Option<&str>, now_ms: i64) -> Result<GateMarker> {
        let marker = GateMarker {
            consulted_at: now_ms,
            query: query.map(str::to_string),
            pid: std::process::id(),
        };
        fsutil::write_atomic(&self.marker_path, &serde_json::to_vec(&marker)?)?;
        info!(target: "actlog::gate", "Marked consulted at {}", now_ms);
        Ok(marker)
    }

    /// Current marker, if one exists and parses.
    pub fn marker(&self) -> Option<GateMarker> {
        let bytes = match std::fs::read(&self.marker_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target: "actlog::gate", "Unreadable gate marker {}: {}", self.marker_path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(target: "actlog::gate", "Malformed gate marker {}: {}", self.marker_path.display(), e);
                None
            }
        }
    }

    pub fn is_consulted(&self) -> bool {
        self.is_consulted_at(actlog_types::now_ms())
    }

    /// True iff a marker exists with `0 <= now - consultedAt < ttl`.
    pub fn is_consulted_at(&self, now_ms: i64) -> bool {
        let Some(marker) = self.marker() else {
            return false;
        };
        let age = now_ms.saturating_sub(marker.consulted_at);
        age >= 0 && (age as u128) < self.ttl.as_millis()
    }

    /// Forget any consultation.
    pub fn clear(&self) -> Result<()> {
        fsutil::remove_if_exists(&self.marker_path)
            .map_err(|e| ActlogError::write_failure(&self.marker_path, e))?;
        debug!(target: "actlog::gate", "Cleared gate marker");
        Ok(())
    }

    pub fn check(&self, tool: &str) -> Decision {
        self.check_at(tool, actlog_types::now_ms())
    }

    pub fn check_at(&self, tool: &str, now_ms: i64) -> Decision {
        if !self.is_protected(tool) || self.is_consulted_at(now_ms) {
            return Decision::Allow;
        }
        debug!(target: "actlog::gate", "Refusing {} until consulted", tool);
        Decision::Deny(ConsultationRequired::for_tool(tool, self.ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gate() -> (ConsultationGate, TempDir) {
        let dir = TempDir::new().unwrap();
        let gate = ConsultationGate::new(dir.path().join("gate").join("consulted.json"))
            .with_ttl(Duration::from_secs(60));
        (gate, dir)
    }

    #[test]
    fn test_unconsulted_without_marker() {
        let (gate, _dir) = gate();
        assert!(!gate.is_consulted());
        assert!(gate.marker().is_none());
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let (gate, _dir) = gate();
        gate.mark_consulted_at(Some("parser"), 1_000_000).unwrap();

        assert!(gate.is_consulted_at(1_000_000));
        assert!(gate.is_consulted_at(1_059_999));
        assert!(!gate.is_consulted_at(1_060_000));
    }

    #[test]
    fn test_mark_then_check_now() {
        let (gate, _dir) = gate();
        gate.mark_consulted(None).unwrap();
        assert!(gate.is_consulted());
    }

    #[test]
    fn test_concurrent_consults_all_succeed() {
        let (gate, _dir) = gate();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|i| {
                    let gate = &gate;
                    s.spawn(move || gate.mark_consulted(Some(format!("query {}", i).as_str())))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });
        assert!(gate.is_consulted());
    }

    #[test]
    fn test_future_marker_is_unconsulted() {
        let (gate, _dir) = gate();
        gate.mark_consulted_at(None, 2_000).unwrap();
        assert!(!gate.is_consulted_at(1_000));
    }

    #[test]
    fn test_malformed_marker_is_unconsulted() {
        let (gate, _dir) = gate();
        std::fs::create_dir_all(gate.marker_path().parent().unwrap()).unwrap();
        std::fs::write(gate.marker_path(), b"{\"consultedAt\": ").unwrap();
        assert!(!gate.is_consulted());
    }

    #[test]
    fn test_marker_contents() {
        let (gate, _dir) = gate();
        gate.mark_consulted_at(Some("flaky test"), 42).unwrap();

        let raw: Value = serde_json::from_slice(&std::fs::read(gate.marker_path()).unwrap()).unwrap();
        assert_eq!(raw["consultedAt"], 42);
        assert_eq!(raw["query"], "flaky test");
        assert_eq!(raw["pid"], std::process::id());
    }

    #[test]
    fn test_clear() {
        let (gate, _dir) = gate();
        gate.mark_consulted(None).unwrap();
        gate.clear().unwrap();
        gate.clear().unwrap();
        assert!(!gate.is_consulted());
    }

    #[test]
    fn test_check_protected_and_unprotected() {
        let (gate, _dir) = gate();
        assert_eq!(gate.check("Bash"), Decision::Allow);

        let Decision::Deny(refusal) = gate.check("Grep") else {
            panic!("Grep should be refused before consulting");
        };
        assert_eq!(refusal.tool, "Grep");
        assert_eq!(refusal.required_call.operation, "consult");
        assert!(refusal.required_call.arguments.get("query").is_some());

        let response = refusal.hook_response();
        assert_eq!(response["decision"], "block");
        assert_eq!(response["requiredCall"]["operation"], "consult");

        gate.mark_consulted(Some("grep target")).unwrap();
        assert!(gate.check("Grep").is_allowed());
    }

    #[test]
    fn test_custom_protected_tools() {
        let (gate, _dir) = gate();
        let gate = gate.with_protected_tools(["WebSearch"]);
        assert!(gate.check("Grep").is_allowed());
        assert!(!gate.check("WebSearch").is_allowed());
    }
}
