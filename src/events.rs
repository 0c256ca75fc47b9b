//! Typed events consumed from a run's live stream.
//!
//! The wire format is newline-delimited JSON with a `type` discriminant.
//! Unknown types are skipped so the client stays forward-compatible with
//! server additions.

use serde::{Deserialize, Serialize};

use crate::types::{ActionRequest, ReviewConfig};

/// One event on a run's live stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunStreamEvent {
    /// Liveness marker; no content change.
    Keepalive,
    /// Run-policy metadata merged onto the message.
    Policy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skill: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requires_artifacts: Option<bool>,
    },
    /// Model reasoning text, appended verbatim (low volume, no coalescing).
    Thought {
        #[serde(alias = "content")]
        text: String,
    },
    /// A tool began executing.
    ToolStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
    },
    /// A tool finished successfully.
    ToolEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        output_files: Vec<String>,
    },
    /// A tool failed.
    ToolError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        message: String,
    },
    /// The run paused for human approval.
    Interrupt {
        #[serde(default)]
        action_requests: Vec<ActionRequest>,
        #[serde(default)]
        review_configs: Vec<ReviewConfig>,
    },
    /// A partial assistant text chunk.
    #[serde(alias = "chunk")]
    Token {
        #[serde(alias = "content")]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    /// The server detected a malformed tool/skill contract; non-fatal.
    ContractError {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing_fields: Vec<String>,
    },
    /// A stream-level application error; non-fatal to the session.
    Error { message: String },
    /// Stream-completion hint emitted before the server closes the stream.
    /// The authoritative status fetch remains ground truth.
    Done,
}

impl RunStreamEvent {
    /// Whether this token/chunk belongs to the assistant. Events with no role
    /// count as assistant; anything else is dropped by the dispatcher.
    pub fn is_assistant_role(role: Option<&str>) -> bool {
        match role {
            None => true,
            Some(r) => r.eq_ignore_ascii_case("assistant"),
        }
    }

    /// Parse one JSONL line into an event, skipping blanks and unknown types.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Self>(line) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::debug!(%err, line, "skipping unrecognized stream event");
                None
            }
        }
    }
}

/// Extra context accompanying a decision submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DecisionBody {
    /// Replacement arguments for the pending action; required (and required
    /// to be a JSON object) when the decision is `edit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_action: Option<serde_json::Value>,
    /// Optional free-form note forwarded to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
