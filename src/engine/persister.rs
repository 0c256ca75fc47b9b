//! Progress Persister: periodic durable checkpoints of in-flight runs.
//!
//! Checkpoints are turn-keyed upserts, so repeating one is safe. A run has at
//! most one persist in flight at a time; a tick that finds one running is
//! skipped, not queued, and the next tick picks up whatever accumulated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::TetherError;
use crate::transport::{AppendMessage, ConversationStore};
use crate::types::{ActiveRunInfo, RunId, RunStatus, Sender};

use super::coalescer::ChunkCoalescer;
use super::lease::KeyedLease;
use super::materializer::Materializer;

#[derive(Debug, Default)]
pub(crate) struct ProgressPersister {
    in_flight: KeyedLease<RunId>,
    /// Last successfully persisted `(text, status)` per run, for idempotence.
    last: Mutex<HashMap<RunId, (String, RunStatus)>>,
}

impl ProgressPersister {
    pub fn new() -> Self {
        Self {
            in_flight: KeyedLease::new(),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Checkpoint the run's message. Returns `Ok(true)` if an upsert was
    /// written, `Ok(false)` if skipped (concurrent persist, no message, or
    /// nothing changed since the last checkpoint).
    pub async fn persist(
        &self,
        store: &Arc<dyn ConversationStore>,
        materializer: &Materializer,
        coalescer: &ChunkCoalescer,
        info: &ActiveRunInfo,
        status_override: Option<RunStatus>,
    ) -> Result<bool, TetherError> {
        let Some(_guard) = self.in_flight.acquire(info.run_id) else {
            return Ok(false);
        };
        let Some(message) = materializer.message_for_run(&info.conversation_id, info.run_id)
        else {
            return Ok(false);
        };
        let status = status_override
            .or(message.status)
            .unwrap_or(RunStatus::Running);
        let mark = (message.text.clone(), status);
        {
            let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if last.get(&info.run_id) == Some(&mark) {
                return Ok(false);
            }
        }

        let request = AppendMessage {
            conversation_id: info.conversation_id.clone(),
            sender: Sender::Agent,
            text: message.text.clone(),
            thinking_text: message.thinking_text.clone(),
            tool_events: message.tool_events.clone(),
            turn_id: Some(info.turn_id),
            run_id: Some(info.run_id),
            status: Some(status),
            metadata: message.metadata.clone().filter(|m| !m.is_empty()),
            replace_existing: true,
        };
        let durable = store.append_message(request).await?;
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.run_id, mark);

        if durable.id != message.id {
            if let Some(bound) =
                materializer.reconcile(&info.conversation_id, &message.id, &durable)
            {
                coalescer.rebind_message(&info.conversation_id, &bound);
            }
        }
        Ok(true)
    }

    /// Drop the idempotence memo once a run leaves the registry.
    pub fn forget(&self, run_id: RunId) {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);
    }
}
