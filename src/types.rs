//! Core data model: runs, conversation messages, tool events, interrupts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier, assigned by the server when a run starts.
pub type RunId = Uuid;

/// Identifier grouping one user prompt with its agent reply.
pub type TurnId = Uuid;

/// Run lifecycle status. Transitions are server-authoritative; the client
/// only ever assigns `Running` as an optimistic default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// A terminal status never transitions again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the run is still (or about to be) producing events.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent,
}

/// Tool event status within a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventStatus {
    Running,
    Completed,
    Error,
}

/// One tool invocation observed on the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEvent {
    pub id: String,
    pub name: String,
    pub status: ToolEventStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<String>,
}

impl ToolEvent {
    /// Open a new running tool event.
    pub fn running(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ToolEventStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            summary: None,
            output_files: Vec::new(),
        }
    }
}

/// Decision kinds a human can submit for a pending interrupt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Edit,
    Reject,
}

impl DecisionKind {
    /// All decisions, in the order the server advertises them.
    pub fn all() -> Vec<DecisionKind> {
        vec![Self::Approve, Self::Edit, Self::Reject]
    }
}

/// A tool action the server has paused on, awaiting a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRequest {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    /// Empty means the server did not constrain decisions (all allowed).
    #[serde(default)]
    pub allowed_decisions: Vec<DecisionKind>,
}

impl ActionRequest {
    /// Decisions permitted for this action; default-allow when unadvertised.
    pub fn effective_decisions(&self) -> Vec<DecisionKind> {
        if self.allowed_decisions.is_empty() {
            DecisionKind::all()
        } else {
            self.allowed_decisions.clone()
        }
    }
}

/// Server-side review policy for an interrupted tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewConfig {
    pub tool: String,
    #[serde(default)]
    pub allowed_decisions: Vec<DecisionKind>,
}

/// Attached to a message while its run is `AwaitingApproval`; cleared as soon
/// as new tool or token activity resumes or a decision is submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PendingInterrupt {
    #[serde(default)]
    pub action_requests: Vec<ActionRequest>,
    #[serde(default)]
    pub review_configs: Vec<ReviewConfig>,
}

/// Run-policy and interrupt metadata carried on an agent message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_artifacts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<PendingInterrupt>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.skill.is_none() && self.requires_artifacts.is_none() && self.pending_interrupt.is_none()
    }
}

/// A turn-scoped unit of conversation.
///
/// The `id` is either a durable identifier (after persistence) or a transient
/// placeholder of the form `agent-<run_id>`; both are treated as equivalent
/// once persistence round-trips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_events: Vec<ToolEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// A fresh agent placeholder standing in for an in-flight run.
    pub fn agent_placeholder(
        conversation_id: impl Into<String>,
        run_id: RunId,
        turn_id: TurnId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: placeholder_id(run_id),
            conversation_id: conversation_id.into(),
            sender: Sender::Agent,
            text: String::new(),
            thinking_text: None,
            tool_events: Vec::new(),
            turn_id: Some(turn_id),
            run_id: Some(run_id),
            status: Some(RunStatus::Running),
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether nothing has streamed into this message yet.
    pub fn is_empty_placeholder(&self) -> bool {
        self.text.is_empty()
            && self.thinking_text.as_deref().unwrap_or_default().is_empty()
            && self.tool_events.is_empty()
    }

    /// The run this message belongs to, from explicit metadata first and the
    /// embedded placeholder id as the bootstrap fallback.
    pub fn run(&self) -> Option<RunId> {
        self.run_id.or_else(|| parse_placeholder_id(&self.id))
    }
}

/// Client-side shadow of a run needed to resume it after a reload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveRunInfo {
    pub run_id: RunId,
    pub conversation_id: String,
    pub workspace_id: String,
    pub persona: String,
    pub turn_id: TurnId,
    pub placeholder_id: String,
    pub status: RunStatus,
}

/// Encode the transient placeholder message id for a run.
pub fn placeholder_id(run_id: RunId) -> String {
    format!("agent-{run_id}")
}

/// Parse a run id back out of a placeholder message id.
pub fn parse_placeholder_id(id: &str) -> Option<RunId> {
    id.strip_prefix("agent-")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}
