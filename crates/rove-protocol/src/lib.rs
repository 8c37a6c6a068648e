// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between the control plane and the sandbox bridge.
//!
//! JSON over WebSocket (text frames). Every message carries a `type`
//! discriminator; commands flow control plane → sandbox, events flow
//! sandbox → control plane.
//!
//! # Typical prompt flow
//!
//! ```text
//! Control plane                        Sandbox bridge
//!     │                                     │
//!     │── prompt {messageId, content} ─────►│  agent prompt submitted
//!     │◄─ token {content, messageId} ───────│  × N (cumulative text)
//!     │◄─ tool_call {tool, status, ...} ────│  (if the agent runs tools)
//!     │◄─ step_start / step_finish ─────────│
//!     │◄─ execution_complete {success} ─────│  exactly one per prompt
//!     │                                     │
//!     │── push {branchName, ...} ──────────►│
//!     │◄─ push_complete {branchName} ───────│
//! ```
//!
//! The bridge attaches `sandboxId` and a float `timestamp` (seconds since
//! epoch) to every outbound event at send time, so the variants here only
//! declare the payload fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Control plane → bridge commands ───────────────────────────────────────────

/// Author attached to a prompt command, used for git commit attribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    #[serde(default)]
    pub github_name: Option<String>,
    #[serde(default)]
    pub github_email: Option<String>,
}

/// Commands sent by the control plane to a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Run one prompt session against the local agent.
    #[serde(rename_all = "camelCase")]
    Prompt {
        #[serde(alias = "message_id")]
        message_id: String,
        #[serde(default)]
        content: String,
        /// Optional model override, either bare (`claude-sonnet-4-6`) or
        /// qualified (`anthropic/claude-sonnet-4-6`).
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        author: Option<Author>,
    },

    /// Abort whatever the agent session is currently doing.
    Stop,

    /// The control plane is about to snapshot the sandbox filesystem.
    Snapshot,

    /// Graceful exit; the supervisor mirrors the shutdown.
    Shutdown,

    /// Supervisor-driven git sync has finished.
    GitSyncComplete,

    /// Push the repository's current HEAD to a remote branch.
    #[serde(rename_all = "camelCase")]
    Push {
        branch_name: String,
        #[serde(default)]
        repo_owner: Option<String>,
        #[serde(default)]
        repo_name: Option<String>,
        /// Just-in-time token minted by the control plane; falls back to
        /// the sandbox's startup token when absent.
        #[serde(default)]
        github_token: Option<String>,
    },
}

// ── Bridge → control plane events ─────────────────────────────────────────────

/// Events emitted by the bridge over the session channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The bridge (re)connected; carries the agent session id if one exists.
    #[serde(rename_all = "camelCase")]
    Ready { agent_session_id: Option<String> },

    /// Periodic liveness signal while the link is open.
    Heartbeat { status: String, timestamp: f64 },

    /// Cumulative text for one part of the assistant response. The content
    /// is the full text so far, never a bare delta.
    #[serde(rename_all = "camelCase")]
    Token { content: String, message_id: String },

    /// A tool call state transition (running, completed, error, ...).
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool: String,
        args: Value,
        call_id: String,
        status: String,
        output: String,
        message_id: String,
    },

    /// The agent began a new reasoning step.
    #[serde(rename_all = "camelCase")]
    StepStart { message_id: String },

    /// The agent finished a reasoning step; cost/tokens/reason pass through
    /// whatever the agent reported.
    #[serde(rename_all = "camelCase")]
    StepFinish {
        #[serde(default)]
        cost: Value,
        #[serde(default)]
        tokens: Value,
        #[serde(default)]
        reason: Value,
        message_id: String,
    },

    /// Terminal event for one prompt. Exactly one per prompt.
    #[serde(rename_all = "camelCase")]
    ExecutionComplete {
        message_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The agent session reported an error for this prompt.
    #[serde(rename_all = "camelCase")]
    Error { error: String, message_id: String },

    /// Acknowledgement that the sandbox is ready to be snapshotted.
    #[serde(rename_all = "camelCase")]
    SnapshotReady { agent_session_id: Option<String> },

    #[serde(rename_all = "camelCase")]
    PushComplete { branch_name: String },

    #[serde(rename_all = "camelCase")]
    PushError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
    },
}

impl Event {
    /// Stable name of the event's wire tag, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Ready { .. } => "ready",
            Event::Heartbeat { .. } => "heartbeat",
            Event::Token { .. } => "token",
            Event::ToolCall { .. } => "tool_call",
            Event::StepStart { .. } => "step_start",
            Event::StepFinish { .. } => "step_finish",
            Event::ExecutionComplete { .. } => "execution_complete",
            Event::Error { .. } => "error",
            Event::SnapshotReady { .. } => "snapshot_ready",
            Event::PushComplete { .. } => "push_complete",
            Event::PushError { .. } => "push_error",
        }
    }
}

// ── Model spec ────────────────────────────────────────────────────────────────

/// Split a model override into `(providerID, modelID)`.
///
/// Qualified specs split on the first `/`; bare model names default to the
/// `anthropic` provider.
pub fn split_model_spec(model: &str) -> (&str, &str) {
    match model.split_once('/') {
        Some((provider, model_id)) => (provider, model_id),
        None => ("anthropic", model),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Command parsing ───────────────────────────────────────────────────────

    #[test]
    fn prompt_command_parses_camel_case_fields() {
        let cmd: Command = serde_json::from_value(json!({
            "type": "prompt",
            "messageId": "msg-1",
            "content": "fix the bug",
            "model": "anthropic/claude-sonnet-4-6",
            "author": {"githubName": "Jane Dev", "githubEmail": "jane@example.com"},
        }))
        .unwrap();
        match cmd {
            Command::Prompt {
                message_id,
                content,
                model,
                author,
            } => {
                assert_eq!(message_id, "msg-1");
                assert_eq!(content, "fix the bug");
                assert_eq!(model.as_deref(), Some("anthropic/claude-sonnet-4-6"));
                let author = author.unwrap();
                assert_eq!(author.github_name.as_deref(), Some("Jane Dev"));
                assert_eq!(author.github_email.as_deref(), Some("jane@example.com"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn prompt_command_accepts_snake_case_message_id() {
        let cmd: Command = serde_json::from_value(json!({
            "type": "prompt",
            "message_id": "msg-2",
            "content": "hello",
        }))
        .unwrap();
        assert!(matches!(cmd, Command::Prompt { message_id, .. } if message_id == "msg-2"));
    }

    #[test]
    fn bare_commands_parse_from_type_alone() {
        for ty in ["stop", "snapshot", "shutdown", "git_sync_complete"] {
            let cmd: Command = serde_json::from_value(json!({ "type": ty })).unwrap();
            let round = serde_json::to_value(&cmd).unwrap();
            assert_eq!(round["type"], ty);
        }
    }

    #[test]
    fn push_command_parses_optional_fields() {
        let cmd: Command = serde_json::from_value(json!({
            "type": "push",
            "branchName": "rove/session-1",
        }))
        .unwrap();
        match cmd {
            Command::Push {
                branch_name,
                repo_owner,
                repo_name,
                github_token,
            } => {
                assert_eq!(branch_name, "rove/session-1");
                assert!(repo_owner.is_none());
                assert!(repo_name.is_none());
                assert!(github_token.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_type_is_an_error() {
        let res: Result<Command, _> = serde_json::from_value(json!({ "type": "reboot" }));
        assert!(res.is_err());
    }

    // ── Event serialization ───────────────────────────────────────────────────

    #[test]
    fn ready_event_uses_camel_case_session_id() {
        let v = serde_json::to_value(Event::Ready {
            agent_session_id: Some("ses_abc".into()),
        })
        .unwrap();
        assert_eq!(v["type"], "ready");
        assert_eq!(v["agentSessionId"], "ses_abc");
    }

    #[test]
    fn token_event_wire_shape() {
        let v = serde_json::to_value(Event::Token {
            content: "Hello world".into(),
            message_id: "msg-1".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "token");
        assert_eq!(v["content"], "Hello world");
        assert_eq!(v["messageId"], "msg-1");
    }

    #[test]
    fn execution_complete_omits_error_on_success() {
        let v = serde_json::to_value(Event::ExecutionComplete {
            message_id: "msg-1".into(),
            success: true,
            error: None,
        })
        .unwrap();
        assert_eq!(v["type"], "execution_complete");
        assert_eq!(v["success"], true);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn execution_complete_carries_error_on_failure() {
        let v = serde_json::to_value(Event::ExecutionComplete {
            message_id: "msg-1".into(),
            success: false,
            error: Some("Task was cancelled".into()),
        })
        .unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "Task was cancelled");
    }

    #[test]
    fn push_error_without_branch_omits_the_field() {
        let v = serde_json::to_value(Event::PushError {
            error: "No repository found".into(),
            branch_name: None,
        })
        .unwrap();
        assert!(v.get("branchName").is_none());
    }

    #[test]
    fn tool_call_event_round_trip() {
        let ev = Event::ToolCall {
            tool: "bash".into(),
            args: json!({"command": "ls"}),
            call_id: "call-1".into(),
            status: "completed".into(),
            output: "README.md".into(),
            message_id: "msg-1".into(),
        };
        let text = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn event_kind_matches_wire_tag() {
        let ev = Event::StepFinish {
            cost: json!(0.01),
            tokens: json!({"input": 10, "output": 5}),
            reason: Value::Null,
            message_id: "msg-1".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], ev.kind());
    }

    // ── Model spec ────────────────────────────────────────────────────────────

    #[test]
    fn split_model_spec_qualified() {
        assert_eq!(
            split_model_spec("anthropic/claude-sonnet-4-6"),
            ("anthropic", "claude-sonnet-4-6")
        );
    }

    #[test]
    fn split_model_spec_bare_defaults_to_anthropic() {
        assert_eq!(
            split_model_spec("claude-haiku-4-5"),
            ("anthropic", "claude-haiku-4-5")
        );
    }

    #[test]
    fn split_model_spec_splits_on_first_slash_only() {
        assert_eq!(
            split_model_spec("openai/gpt-5/preview"),
            ("openai", "gpt-5/preview")
        );
    }
}
