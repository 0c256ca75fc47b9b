//! Transport seams: the server run API and durable conversation storage.
//!
//! The engine is written against these traits; `http` provides the concrete
//! client for the agent service, and tests substitute scripted mocks.

pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TetherError;
use crate::events::{DecisionBody, RunStreamEvent};
use crate::types::{
    ConversationMessage, DecisionKind, MessageMetadata, RunId, RunStatus, Sender, ToolEvent,
    TurnId,
};

/// Live event sequence for one run, consumed until the server closes it or
/// the caller drops the stream.
pub type EventStream = BoxStream<'static, Result<RunStreamEvent, TetherError>>;

/// Request payload to start a run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartRunRequest {
    pub conversation_id: String,
    pub workspace_id: String,
    pub persona: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ConversationMessage>>,
    pub turn_id: TurnId,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, String>,
}

impl StartRunRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        workspace_id: impl Into<String>,
        persona: impl Into<String>,
        prompt: impl Into<String>,
        turn_id: TurnId,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            workspace_id: workspace_id.into(),
            persona: persona.into(),
            prompt: prompt.into(),
            history: None,
            turn_id,
            options: HashMap::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Server acknowledgement for a started run.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RunStarted {
    pub run_id: RunId,
}

/// Client for the server-side run API. Run state is server-authoritative;
/// the client only reads it here.
#[async_trait]
pub trait RunTransport: Send + Sync {
    async fn start_run(&self, request: StartRunRequest) -> Result<RunStarted, TetherError>;

    /// Open the live event stream for a run. One stream per conversation is
    /// enforced by the engine, not here.
    async fn open_stream(&self, run_id: RunId) -> Result<EventStream, TetherError>;

    /// Authoritative status fetch; the stream's own termination reason is
    /// only a hint.
    async fn run_status(&self, run_id: RunId) -> Result<RunStatus, TetherError>;

    async fn cancel_run(&self, run_id: RunId) -> Result<(), TetherError>;

    async fn submit_decision(
        &self,
        run_id: RunId,
        decision: DecisionKind,
        body: DecisionBody,
    ) -> Result<(), TetherError>;
}

/// Upsert payload for durable conversation storage. With `replace_existing`,
/// the write is keyed by `turn_id` and overwrites rather than appends, which
/// is what makes repeated checkpoints of the same turn safe.
#[derive(Debug, Clone)]
pub struct AppendMessage {
    pub conversation_id: String,
    pub sender: Sender,
    pub text: String,
    pub thinking_text: Option<String>,
    pub tool_events: Vec<ToolEvent>,
    pub turn_id: Option<TurnId>,
    pub run_id: Option<RunId>,
    pub status: Option<RunStatus>,
    pub metadata: Option<MessageMetadata>,
    pub replace_existing: bool,
}

impl AppendMessage {
    pub fn user(conversation_id: impl Into<String>, text: impl Into<String>, turn_id: TurnId) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender: Sender::User,
            text: text.into(),
            thinking_text: None,
            tool_events: Vec::new(),
            turn_id: Some(turn_id),
            run_id: None,
            status: None,
            metadata: None,
            replace_existing: false,
        }
    }
}

/// A conversation plus its persisted messages.
#[derive(Debug, Clone)]
pub struct ConversationDetail {
    pub conversation_id: String,
    pub messages: Vec<ConversationMessage>,
}

/// Durable conversation storage.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(
        &self,
        request: AppendMessage,
    ) -> Result<ConversationMessage, TetherError>;

    async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationDetail, TetherError>;
}

/// Collaborator refreshed on a light cadence while a conversation streams,
/// so workspace file listings stay current during tool-heavy runs.
#[async_trait]
pub trait WorkspaceWatcher: Send + Sync {
    async fn refresh(&self, workspace_id: &str);
}
