//! The streaming engine: run lifecycle, coalescing, checkpointing, and
//! resumption orchestrated over the transport seams.
//!
//! [`StreamEngine`] is the single entry point. It owns all mutable state
//! behind an `Arc`, so clones are cheap and every operation can be called
//! from any task.

mod coalescer;
mod dispatch;
mod interrupt;
mod lease;
mod materializer;
mod persister;
pub mod registry;
mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::TetherError;
use crate::events::DecisionBody;
use crate::transport::{
    AppendMessage, ConversationStore, RunTransport, StartRunRequest, WorkspaceWatcher,
};
use crate::types::{
    placeholder_id, ActiveRunInfo, ConversationMessage, DecisionKind, RunId, RunStatus, Sender,
};

use coalescer::ChunkCoalescer;
use materializer::Materializer;
use persister::ProgressPersister;
use registry::{ActiveRunRegistry, RegistryStore};
use session::{open_session, SessionHandle};

pub(crate) use lease::KeyedLease;

/// Notifications pushed to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A conversation's message snapshot changed; re-read via
    /// [`StreamEngine::messages`].
    MessagesUpdated { conversation_id: String },
    RunStarted {
        conversation_id: String,
        run_id: RunId,
    },
    RunResumed {
        conversation_id: String,
        run_id: RunId,
    },
    /// The run paused on a tool action and needs a human decision.
    ApprovalRequired {
        conversation_id: String,
        run_id: RunId,
    },
    RunFinished {
        conversation_id: String,
        run_id: RunId,
        status: RunStatus,
    },
}

/// Callback invoked on every [`EngineEvent`]. Must be cheap; it runs inline
/// on engine tasks.
pub type EngineEventSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn RunTransport>,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) registry: ActiveRunRegistry,
    pub(crate) materializer: Materializer,
    pub(crate) coalescer: ChunkCoalescer,
    pub(crate) persister: ProgressPersister,
    pub(crate) sessions: Mutex<HashMap<String, SessionHandle>>,
    /// One resumption attempt per run per engine lifetime.
    pub(crate) resume_guard: KeyedLease<RunId>,
    pub(crate) watcher: OnceLock<Arc<dyn WorkspaceWatcher>>,
    pub(crate) sink: OnceLock<EngineEventSink>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) session_seq: AtomicU64,
    started: AtomicBool,
}

impl EngineInner {
    pub(crate) fn emit(&self, event: EngineEvent) {
        if let Some(sink) = self.sink.get() {
            sink(event);
        }
    }

    /// Drain one conversation's chunk buffer into its message, in stream
    /// order. Used for in-order appends ahead of banners and markers.
    pub(crate) fn flush_conversation(&self, conversation_id: &str) {
        if let Some(chunk) = self.coalescer.take_conversation(conversation_id) {
            self.materializer
                .append_text(&chunk.conversation_id, &chunk.message_id, &chunk.text);
            self.emit(EngineEvent::MessagesUpdated {
                conversation_id: chunk.conversation_id,
            });
        }
    }

    fn flush_all(&self) {
        for chunk in self.coalescer.take_all() {
            self.materializer
                .append_text(&chunk.conversation_id, &chunk.message_id, &chunk.text);
            self.emit(EngineEvent::MessagesUpdated {
                conversation_id: chunk.conversation_id,
            });
        }
    }

    fn is_streaming(&self, conversation_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(conversation_id)
    }

    async fn persist_active(&self) {
        for info in self.registry.snapshot() {
            if info.status.is_terminal() {
                continue;
            }
            let streaming = self
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&info.conversation_id)
                .is_some_and(|handle| handle.run_id == info.run_id);
            if !streaming {
                continue;
            }
            if let Err(err) = self
                .persister
                .persist(&self.store, &self.materializer, &self.coalescer, &info, None)
                .await
            {
                tracing::warn!(run_id = %info.run_id, %err, "checkpoint failed, retrying next tick");
            }
        }
    }
}

/// Client-side engine for consuming, checkpointing, and resuming agent run
/// event streams.
#[derive(Clone)]
pub struct StreamEngine {
    inner: Arc<EngineInner>,
}

impl StreamEngine {
    pub fn new(
        transport: Arc<dyn RunTransport>,
        store: Arc<dyn ConversationStore>,
        registry_store: Arc<dyn RegistryStore>,
        config: EngineConfig,
    ) -> Self {
        let coalescer = ChunkCoalescer::new(config.echo_suppression);
        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                store,
                registry: ActiveRunRegistry::new(registry_store),
                materializer: Materializer::new(),
                coalescer,
                persister: ProgressPersister::new(),
                sessions: Mutex::new(HashMap::new()),
                resume_guard: KeyedLease::new(),
                watcher: OnceLock::new(),
                sink: OnceLock::new(),
                shutdown: CancellationToken::new(),
                session_seq: AtomicU64::new(0),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Receive engine notifications. Set before [`start`](Self::start); later
    /// calls are ignored.
    pub fn with_event_sink(self, sink: EngineEventSink) -> Self {
        let _ = self.inner.sink.set(sink);
        self
    }

    /// Refresh workspace listings on a light cadence while streaming.
    pub fn with_workspace_watcher(self, watcher: Arc<dyn WorkspaceWatcher>) -> Self {
        let _ = self.inner.watcher.set(watcher);
        self
    }

    /// Load the durable registry and start the flush and checkpoint timers.
    pub fn start(&self) -> Result<(), TetherError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.registry.load()?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => inner.flush_all(),
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.persist_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => inner.persist_active().await,
                }
            }
        });
        Ok(())
    }

    /// Stop all timers and abort every live session. Runs already registered
    /// stay resumable on the next engine start.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Persist the user prompt, start a run for it, and open its stream.
    pub async fn send_prompt(
        &self,
        conversation_id: &str,
        workspace_id: &str,
        persona: &str,
        prompt: &str,
    ) -> Result<RunId, TetherError> {
        let turn_id = Uuid::new_v4();
        let durable_user = self
            .inner
            .store
            .append_message(AppendMessage::user(conversation_id, prompt, turn_id))
            .await?;
        self.inner.materializer.push(durable_user);
        self.inner.emit(EngineEvent::MessagesUpdated {
            conversation_id: conversation_id.to_string(),
        });

        let started = self
            .inner
            .transport
            .start_run(StartRunRequest::new(
                conversation_id,
                workspace_id,
                persona,
                prompt,
                turn_id,
            ))
            .await?;

        let info = ActiveRunInfo {
            run_id: started.run_id,
            conversation_id: conversation_id.to_string(),
            workspace_id: workspace_id.to_string(),
            persona: persona.to_string(),
            turn_id,
            placeholder_id: placeholder_id(started.run_id),
            status: RunStatus::Running,
        };
        self.inner.registry.register(info.clone());
        open_session(&self.inner, info, Some(prompt.to_string()), true);
        self.inner.emit(EngineEvent::RunStarted {
            conversation_id: conversation_id.to_string(),
            run_id: started.run_id,
        });
        Ok(started.run_id)
    }

    /// Soft-cancel: abort the local stream immediately, then ask the server
    /// to cancel. The server call is best-effort; the local abort is not.
    pub async fn stop(&self, conversation_id: &str) -> Result<(), TetherError> {
        let run_id = {
            let sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let Some(handle) = sessions.get(conversation_id) else {
                return Ok(());
            };
            handle.stop_requested.store(true, Ordering::Relaxed);
            handle.cancel.cancel();
            handle.run_id
        };
        if let Err(err) = self.inner.transport.cancel_run(run_id).await {
            tracing::warn!(run_id = %run_id, %err, "server-side cancel failed");
        }
        Ok(())
    }

    /// Fetch durable history for a conversation and, if a registered run is
    /// still live on the server, resume its stream. Resumption is attempted
    /// at most once per run per engine lifetime.
    pub async fn activate_conversation(&self, conversation_id: &str) -> Result<(), TetherError> {
        if self.inner.is_streaming(conversation_id) {
            return Ok(());
        }
        let detail = self.inner.store.fetch_conversation(conversation_id).await?;
        self.inner
            .materializer
            .replace_all(conversation_id, detail.messages);
        self.inner.emit(EngineEvent::MessagesUpdated {
            conversation_id: conversation_id.to_string(),
        });
        self.resume_if_needed(conversation_id).await;
        Ok(())
    }

    async fn resume_if_needed(&self, conversation_id: &str) {
        let snapshot = self.inner.materializer.snapshot(conversation_id);
        let Some(info) = self
            .inner
            .registry
            .get_for_conversation(conversation_id, &snapshot)
        else {
            return;
        };
        if !self.inner.resume_guard.claim(info.run_id) {
            return;
        }

        match self.inner.transport.run_status(info.run_id).await {
            Ok(status) if status.is_active() => {
                // The server replays the run from the start; the original
                // prompt lets the echo check apply to the replay too.
                let prompt = snapshot
                    .iter()
                    .find(|m| m.sender == Sender::User && m.turn_id == Some(info.turn_id))
                    .map(|m| m.text.clone());
                let mut resumed = info;
                resumed.status = RunStatus::Running;
                self.inner.registry.register(resumed.clone());
                let run_id = resumed.run_id;
                open_session(&self.inner, resumed, prompt, true);
                self.inner.emit(EngineEvent::RunResumed {
                    conversation_id: conversation_id.to_string(),
                    run_id,
                });
            }
            Ok(RunStatus::AwaitingApproval) => {
                // No stream to resume; the gate is restored from the
                // persisted metadata in the fetched history.
                self.inner
                    .materializer
                    .update_by_run(conversation_id, info.run_id, |m| {
                        m.status = Some(RunStatus::AwaitingApproval);
                    });
                let mut waiting = info;
                waiting.status = RunStatus::AwaitingApproval;
                let run_id = waiting.run_id;
                self.inner.registry.register(waiting);
                self.inner.emit(EngineEvent::ApprovalRequired {
                    conversation_id: conversation_id.to_string(),
                    run_id,
                });
                self.inner.emit(EngineEvent::MessagesUpdated {
                    conversation_id: conversation_id.to_string(),
                });
            }
            Ok(status) => self.finish_stale_run(conversation_id, &info, Some(status)),
            Err(err) => {
                tracing::warn!(run_id = %info.run_id, %err, "resume status fetch failed");
                self.finish_stale_run(conversation_id, &info, None);
            }
        }
    }

    /// The registered run turned out to be over (or unknowable). Clean up the
    /// registry and any empty placeholder left behind.
    fn finish_stale_run(
        &self,
        conversation_id: &str,
        info: &ActiveRunInfo,
        status: Option<RunStatus>,
    ) {
        if let Some(message) = self
            .inner
            .materializer
            .message_for_run(conversation_id, info.run_id)
        {
            if message.is_empty_placeholder() {
                self.inner
                    .materializer
                    .remove_message(conversation_id, &message.id);
            } else if let Some(status) = status {
                self.inner
                    .materializer
                    .update_by_run(conversation_id, info.run_id, |m| {
                        m.status = Some(status);
                    });
            }
        }
        self.inner.registry.remove(info.run_id);
        self.inner.persister.forget(info.run_id);
        self.inner.emit(EngineEvent::MessagesUpdated {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Submit a human decision for the conversation's pending interrupt and
    /// reopen the run's stream. Validation is local and happens before any
    /// network call.
    pub async fn submit_decision(
        &self,
        conversation_id: &str,
        decision: DecisionKind,
        body: DecisionBody,
    ) -> Result<(), TetherError> {
        let snapshot = self.inner.materializer.snapshot(conversation_id);
        let Some(message) = snapshot.iter().find(|m| {
            m.metadata
                .as_ref()
                .is_some_and(|md| md.pending_interrupt.is_some())
        }) else {
            return Err(TetherError::InvalidState(
                "no pending interrupt in this conversation".to_string(),
            ));
        };
        let pending = message
            .metadata
            .as_ref()
            .and_then(|md| md.pending_interrupt.clone())
            .unwrap_or_default();
        interrupt::validate_decision(&pending, decision, &body)?;

        let info = match self
            .inner
            .registry
            .get_for_conversation(conversation_id, &snapshot)
        {
            Some(info) => info,
            // Registry lost (e.g. pruned file); rebuild from the message.
            None => {
                let run_id = message.run().ok_or_else(|| {
                    TetherError::InvalidState(
                        "interrupted message has no run identity".to_string(),
                    )
                })?;
                let turn_id = message.turn_id.ok_or_else(|| {
                    TetherError::InvalidState("interrupted message has no turn".to_string())
                })?;
                ActiveRunInfo {
                    run_id,
                    conversation_id: conversation_id.to_string(),
                    workspace_id: String::new(),
                    persona: String::new(),
                    turn_id,
                    placeholder_id: message.id.clone(),
                    status: RunStatus::AwaitingApproval,
                }
            }
        };

        self.inner
            .transport
            .submit_decision(info.run_id, decision, body)
            .await?;

        self.inner
            .materializer
            .update_by_run(conversation_id, info.run_id, |m| {
                if let Some(metadata) = m.metadata.as_mut() {
                    metadata.pending_interrupt = None;
                }
                m.status = Some(RunStatus::Running);
            });
        let mut resumed = info;
        resumed.status = RunStatus::Running;
        self.inner.registry.register(resumed.clone());
        // Same run resumes mid-flight; streamed text so far is kept.
        open_session(&self.inner, resumed, None, false);
        self.inner.emit(EngineEvent::MessagesUpdated {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Latest committed message snapshot for a conversation.
    pub fn messages(&self, conversation_id: &str) -> Arc<[ConversationMessage]> {
        self.inner.materializer.snapshot(conversation_id)
    }

    /// Whether a live stream session exists for the conversation.
    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.inner.is_streaming(conversation_id)
    }
}
