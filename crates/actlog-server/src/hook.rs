//! Producer-side hook adapter.
//!
//! Runs inside the short-lived process the assistant spawns for every hook
//! event: reads the event JSON, consults the gate for `PreToolUse`, and appends
//! a transaction draft to the queue. It never opens the store.

use actlog_core::{ConsultationGate, ConsultationRequired, Decision, QueueWriter};
use actlog_types::{HookInput, HookPhase, QueueKind, TransactionDraft};
use serde_json::Value;
use tracing::{debug, error, warn};

/// Exit code that makes the assistant block the pending tool call.
pub const EXIT_BLOCK: i32 = 2;

/// What the hook process prints and how it exits.
///
/// On [`EXIT_BLOCK`] the assistant ignores stdout and hands stderr to the
/// model, so refusals travel on stderr.
#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl HookOutcome {
    fn ok() -> Self {
        Self {
            exit_code: 0,
            stdout: None,
            stderr: None,
        }
    }

    fn blocked(refusal: &ConsultationRequired) -> Self {
        Self {
            exit_code: EXIT_BLOCK,
            stdout: None,
            stderr: Some(format!("{}\n{}", refusal.reason, refusal.hook_response())),
        }
    }
}

/// Handle one hook invocation.
///
/// `event` is the event name from the command line; it fills in
/// `hook_event_name` when the payload lacks one.
pub fn handle(event: &str, stdin: &str, gate: &ConsultationGate, writer: &QueueWriter) -> HookOutcome {
    let input = match parse_input(event, stdin) {
        Ok(input) => input,
        Err(e) => {
            warn!(target: "actlog::hook", "Ignoring unreadable {} hook input: {}", event, e);
            return HookOutcome::ok();
        }
    };

    if input.phase() == Some(HookPhase::PreToolUse) {
        let tool = input.tool_name.as_deref().unwrap_or_default();
        return match gate.check(tool) {
            Decision::Allow => HookOutcome::ok(),
            Decision::Deny(refusal) => {
                let mut draft = input.to_draft();
                if let Some(result) = draft.result.as_mut() {
                    result.success = Some(false);
                    result.error = Some(refusal.reason.clone());
                }
                // The refusal stands even when it cannot be recorded.
                enqueue(writer, draft);
                HookOutcome::blocked(&refusal)
            }
        };
    }

    if enqueue(writer, input.to_draft()) {
        HookOutcome::ok()
    } else {
        HookOutcome {
            exit_code: 1,
            ..HookOutcome::ok()
        }
    }
}

fn parse_input(event: &str, stdin: &str) -> serde_json::Result<HookInput> {
    let mut value: Value = if stdin.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(stdin)?
    };

    if let Value::Object(map) = &mut value {
        let has_name = map
            .get("hook_event_name")
            .or_else(|| map.get("hookEventName"))
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if !has_name {
            map.insert("hook_event_name".to_string(), Value::String(event.to_string()));
        }
    }
    serde_json::from_value(value)
}

/// Append a draft to the transactions queue. Returns whether it was written.
fn enqueue(writer: &QueueWriter, draft: TransactionDraft) -> bool {
    let payload = match serde_json::to_value(&draft) {
        Ok(payload) => payload,
        Err(e) => {
            error!(target: "actlog::hook", "Could not encode transaction draft: {}", e);
            return false;
        }
    };
    match writer.append(QueueKind::Transactions, payload) {
        Ok(entry) => {
            debug!(target: "actlog::hook", "Queued transaction {:?}", entry.dedup_token);
            true
        }
        Err(e) => {
            error!(target: "actlog::hook", "Could not queue transaction: {}", e);
            false
        }
    }
}
