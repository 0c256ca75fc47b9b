//! Scripted transport and store doubles for engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use tether::engine::{EngineEvent, EngineEventSink};
use tether::error::TetherError;
use tether::events::{DecisionBody, RunStreamEvent};
use tether::transport::{
    AppendMessage, ConversationDetail, ConversationStore, EventStream, RunStarted, RunTransport,
    StartRunRequest,
};
use tether::types::{ConversationMessage, DecisionKind, RunId, RunStatus};

type ScriptedEvent = Result<RunStreamEvent, TetherError>;

#[derive(Default)]
struct TransportState {
    next_runs: Vec<RunId>,
    streams: HashMap<RunId, Vec<UnboundedReceiverStream<ScriptedEvent>>>,
    statuses: HashMap<RunId, RunStatus>,
    started: Vec<StartRunRequest>,
    opened: HashMap<RunId, usize>,
    cancelled: Vec<RunId>,
    decisions: Vec<(RunId, DecisionKind, DecisionBody)>,
}

/// Scripted [`RunTransport`]: tests queue run ids, event streams, and status
/// answers up front, then assert on the recorded calls.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the run id the next `start_run` call hands back.
    pub fn expect_start(&self, run_id: RunId) {
        self.state.lock().unwrap().next_runs.push(run_id);
    }

    /// Queue one event stream for a run and return the sender feeding it.
    /// Dropping the sender closes the stream.
    pub fn script_stream(&self, run_id: RunId) -> UnboundedSender<ScriptedEvent> {
        let (tx, rx) = unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .streams
            .entry(run_id)
            .or_default()
            .push(UnboundedReceiverStream::new(rx));
        tx
    }

    pub fn set_status(&self, run_id: RunId, status: RunStatus) {
        self.state.lock().unwrap().statuses.insert(run_id, status);
    }

    pub fn open_count(&self, run_id: RunId) -> usize {
        self.state
            .lock()
            .unwrap()
            .opened
            .get(&run_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn cancelled_runs(&self) -> Vec<RunId> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn decisions(&self) -> Vec<(RunId, DecisionKind, DecisionBody)> {
        self.state.lock().unwrap().decisions.clone()
    }

    pub fn started_requests(&self) -> Vec<StartRunRequest> {
        self.state.lock().unwrap().started.clone()
    }
}

#[async_trait]
impl RunTransport for MockTransport {
    async fn start_run(&self, request: StartRunRequest) -> Result<RunStarted, TetherError> {
        let mut state = self.state.lock().unwrap();
        state.started.push(request);
        let run_id = state
            .next_runs
            .pop()
            .ok_or_else(|| TetherError::Stream("no scripted run id".to_string()))?;
        state.statuses.entry(run_id).or_insert(RunStatus::Running);
        Ok(RunStarted { run_id })
    }

    async fn open_stream(&self, run_id: RunId) -> Result<EventStream, TetherError> {
        let mut state = self.state.lock().unwrap();
        *state.opened.entry(run_id).or_insert(0) += 1;
        let stream = state
            .streams
            .get_mut(&run_id)
            .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)))
            .ok_or_else(|| TetherError::Stream("no scripted stream".to_string()))?;
        Ok(Box::pin(stream))
    }

    async fn run_status(&self, run_id: RunId) -> Result<RunStatus, TetherError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .statuses
            .get(&run_id)
            .copied()
            .unwrap_or(RunStatus::Completed))
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<(), TetherError> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(run_id);
        state.statuses.insert(run_id, RunStatus::Cancelled);
        Ok(())
    }

    async fn submit_decision(
        &self,
        run_id: RunId,
        decision: DecisionKind,
        body: DecisionBody,
    ) -> Result<(), TetherError> {
        self.state
            .lock()
            .unwrap()
            .decisions
            .push((run_id, decision, body));
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    seq: u64,
    conversations: HashMap<String, Vec<ConversationMessage>>,
    appends: Vec<AppendMessage>,
}

/// In-memory [`ConversationStore`] with turn-keyed upsert semantics.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pre-populate durable history, e.g. for reload scenarios.
    pub fn seed(&self, conversation_id: &str, messages: Vec<ConversationMessage>) {
        self.state
            .lock()
            .unwrap()
            .conversations
            .insert(conversation_id.to_string(), messages);
    }

    pub fn appends(&self) -> Vec<AppendMessage> {
        self.state.lock().unwrap().appends.clone()
    }

    /// Durable upserts recorded for one run.
    pub fn checkpoints(&self, run_id: RunId) -> Vec<AppendMessage> {
        self.appends()
            .into_iter()
            .filter(|a| a.replace_existing && a.run_id == Some(run_id))
            .collect()
    }

    pub fn durable_messages(&self, conversation_id: &str) -> Vec<ConversationMessage> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationStore for MockStore {
    async fn append_message(
        &self,
        request: AppendMessage,
    ) -> Result<ConversationMessage, TetherError> {
        let mut state = self.state.lock().unwrap();
        state.appends.push(request.clone());
        let messages = state
            .conversations
            .entry(request.conversation_id.clone())
            .or_default();

        if request.replace_existing {
            if let Some(existing) = messages.iter_mut().find(|m| {
                m.sender == request.sender
                    && request.turn_id.is_some()
                    && m.turn_id == request.turn_id
            }) {
                existing.text = request.text.clone();
                existing.thinking_text = request.thinking_text.clone();
                existing.tool_events = request.tool_events.clone();
                existing.run_id = request.run_id;
                existing.status = request.status;
                existing.metadata = request.metadata.clone();
                existing.updated_at = Utc::now();
                return Ok(existing.clone());
            }
        }

        state.seq += 1;
        let id = format!("m-{}", state.seq);
        let now = Utc::now();
        let message = ConversationMessage {
            id,
            conversation_id: request.conversation_id.clone(),
            sender: request.sender,
            text: request.text,
            thinking_text: request.thinking_text,
            tool_events: request.tool_events,
            turn_id: request.turn_id,
            run_id: request.run_id,
            status: request.status,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        state
            .conversations
            .get_mut(&message.conversation_id)
            .expect("conversation entry")
            .push(message.clone());
        Ok(message)
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationDetail, TetherError> {
        Ok(ConversationDetail {
            conversation_id: conversation_id.to_string(),
            messages: self.durable_messages(conversation_id),
        })
    }
}

/// Event sink that records everything it sees.
pub fn capture_sink() -> (EngineEventSink, Arc<Mutex<Vec<EngineEvent>>>) {
    let captured: Arc<Mutex<Vec<EngineEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_target = Arc::clone(&captured);
    let sink: EngineEventSink = Arc::new(move |event| {
        sink_target.lock().unwrap().push(event);
    });
    (sink, captured)
}

/// Poll until the condition holds, panicking after a generous timeout.
pub async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
