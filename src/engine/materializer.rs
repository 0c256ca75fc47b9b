//! Message Materializer: sole owner of the in-memory conversation lists.
//!
//! Lists are stored as `Arc<[ConversationMessage]>` snapshots replaced
//! wholesale on every mutation, so concurrent readers only ever observe
//! fully committed states. Invariant: at most one agent message exists per
//! turn within a conversation; earlier placeholders for the same turn are
//! replaced, not duplicated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::types::{
    parse_placeholder_id, ConversationMessage, RunId, RunStatus, Sender, TurnId,
};

#[derive(Debug, Default)]
pub(crate) struct Materializer {
    conversations: Mutex<HashMap<String, Arc<[ConversationMessage]>>>,
}

impl Materializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot read of the latest committed message list.
    pub fn snapshot(&self, conversation_id: &str) -> Arc<[ConversationMessage]> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Replace a conversation's messages, e.g. from a fresh server fetch.
    pub fn replace_all(&self, conversation_id: &str, messages: Vec<ConversationMessage>) {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conversation_id.to_string(), Arc::from(messages));
    }

    /// Append a committed message (user prompt or durable agent message).
    pub fn push(&self, message: ConversationMessage) {
        self.mutate(&message.conversation_id.clone(), move |messages| {
            messages.push(message);
        });
    }

    /// Idempotently materialize the placeholder for an in-flight run and
    /// return the id of the message the stream should flow into.
    ///
    /// Reuses, in order: a message with `placeholder` as id, a message whose
    /// run metadata matches the embedded run id, or the agent message for
    /// `turn_id`. With `reset_text` set (resume-from-start or rerun), streamed
    /// content is cleared since the server replays the run from the start.
    pub fn ensure_placeholder(
        &self,
        conversation_id: &str,
        placeholder: &str,
        turn_id: TurnId,
        reset_text: bool,
    ) -> String {
        let run_id = parse_placeholder_id(placeholder);
        let mut bound_id = placeholder.to_string();
        self.mutate(conversation_id, |messages| {
            let existing = messages.iter_mut().find(|m| {
                m.id == placeholder
                    || (m.sender == Sender::Agent
                        && (run_id.is_some() && m.run() == run_id
                            || m.turn_id == Some(turn_id)))
            });
            if let Some(message) = existing {
                if reset_text {
                    message.text.clear();
                    message.thinking_text = None;
                    message.tool_events.clear();
                }
                message.status = Some(RunStatus::Running);
                message.updated_at = Utc::now();
                bound_id = message.id.clone();
                return;
            }
            let mut fresh = ConversationMessage::agent_placeholder(
                conversation_id,
                run_id.unwrap_or_default(),
                turn_id,
            );
            fresh.id = placeholder.to_string();
            fresh.run_id = run_id;
            bound_id = fresh.id.clone();
            messages.push(fresh);
        });
        bound_id
    }

    /// Mutate the message with the given id. Returns false if not found.
    pub fn update_message<F>(&self, conversation_id: &str, message_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ConversationMessage),
    {
        let mut found = false;
        self.mutate(conversation_id, |messages| {
            if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
                f(message);
                message.updated_at = Utc::now();
                found = true;
            }
        });
        found
    }

    /// Mutate the agent message belonging to a run, located by explicit run
    /// metadata or the embedded placeholder id. Returns the message id.
    pub fn update_by_run<F>(&self, conversation_id: &str, run_id: RunId, f: F) -> Option<String>
    where
        F: FnOnce(&mut ConversationMessage),
    {
        let mut updated = None;
        self.mutate(conversation_id, |messages| {
            if let Some(message) = messages.iter_mut().find(|m| m.run() == Some(run_id)) {
                f(message);
                message.updated_at = Utc::now();
                updated = Some(message.id.clone());
            }
        });
        updated
    }

    /// Fetch the agent message for a run, if any.
    pub fn message_for_run(
        &self,
        conversation_id: &str,
        run_id: RunId,
    ) -> Option<ConversationMessage> {
        self.snapshot(conversation_id)
            .iter()
            .find(|m| m.run() == Some(run_id))
            .cloned()
    }

    /// Whether the run's message is currently holding a pending interrupt.
    /// Read-only; safe to call on the token hot path.
    pub fn is_gated(&self, conversation_id: &str, run_id: RunId) -> bool {
        self.snapshot(conversation_id)
            .iter()
            .find(|m| m.run() == Some(run_id))
            .is_some_and(|m| {
                m.status == Some(RunStatus::AwaitingApproval)
                    || m.metadata
                        .as_ref()
                        .is_some_and(|md| md.pending_interrupt.is_some())
            })
    }

    pub fn append_text(&self, conversation_id: &str, message_id: &str, text: &str) {
        self.update_message(conversation_id, message_id, |message| {
            message.text.push_str(text);
        });
    }

    pub fn remove_message(&self, conversation_id: &str, message_id: &str) -> bool {
        let mut removed = false;
        self.mutate(conversation_id, |messages| {
            let before = messages.len();
            messages.retain(|m| m.id != message_id);
            removed = messages.len() != before;
        });
        removed
    }

    /// Reconcile the in-flight placeholder with the durable message returned
    /// by the store: adopt the durable id and creation time, keep the locally
    /// materialized content, and collapse any duplicate for the same turn.
    /// Returns the durable id now bound to the message.
    pub fn reconcile(
        &self,
        conversation_id: &str,
        current_id: &str,
        durable: &ConversationMessage,
    ) -> Option<String> {
        let mut bound = None;
        self.mutate(conversation_id, |messages| {
            let target = messages
                .iter()
                .position(|m| m.id == current_id)
                .or_else(|| {
                    messages.iter().position(|m| {
                        m.sender == Sender::Agent
                            && durable.turn_id.is_some()
                            && m.turn_id == durable.turn_id
                    })
                });
            let Some(index) = target else {
                return;
            };
            messages[index].id = durable.id.clone();
            messages[index].created_at = durable.created_at;
            messages[index].updated_at = Utc::now();
            if messages[index].run_id.is_none() {
                messages[index].run_id = durable.run_id;
            }
            // One agent message per turn: drop any other copy the store fetch
            // may have introduced.
            let keep_id = messages[index].id.clone();
            let turn = messages[index].turn_id;
            let mut seen = false;
            messages.retain(|m| {
                let same = m.id == keep_id
                    || (m.sender == Sender::Agent && turn.is_some() && m.turn_id == turn);
                if same {
                    if seen {
                        return false;
                    }
                    seen = true;
                }
                true
            });
            bound = Some(keep_id);
        });
        bound
    }

    fn mutate<F>(&self, conversation_id: &str, f: F)
    where
        F: FnOnce(&mut Vec<ConversationMessage>),
    {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let mut messages: Vec<ConversationMessage> = conversations
            .get(conversation_id)
            .map(|arc| arc.to_vec())
            .unwrap_or_default();
        f(&mut messages);
        conversations.insert(conversation_id.to_string(), Arc::from(messages));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::placeholder_id;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn ensure_placeholder_is_idempotent() {
        let materializer = Materializer::new();
        let run_id = Uuid::new_v4();
        let turn_id = Uuid::new_v4();
        let placeholder = placeholder_id(run_id);

        let first = materializer.ensure_placeholder("conv-1", &placeholder, turn_id, false);
        materializer.append_text("conv-1", &first, "partial");
        let second = materializer.ensure_placeholder("conv-1", &placeholder, turn_id, false);

        assert_eq!(first, second);
        let messages = materializer.snapshot("conv-1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "partial");
        assert_eq!(messages[0].run_id, Some(run_id));
    }

    #[test]
    fn ensure_placeholder_reset_clears_streamed_content() {
        let materializer = Materializer::new();
        let run_id = Uuid::new_v4();
        let turn_id = Uuid::new_v4();
        let placeholder = placeholder_id(run_id);

        let id = materializer.ensure_placeholder("conv-1", &placeholder, turn_id, false);
        materializer.update_message("conv-1", &id, |m| {
            m.text = "stale".to_string();
            m.thinking_text = Some("old thoughts".to_string());
            m.tool_events
                .push(crate::types::ToolEvent::running("t-1", "search"));
        });

        materializer.ensure_placeholder("conv-1", &placeholder, turn_id, true);
        let messages = materializer.snapshot("conv-1");
        assert!(messages[0].text.is_empty());
        assert!(messages[0].thinking_text.is_none());
        assert!(messages[0].tool_events.is_empty());
    }

    #[test]
    fn ensure_placeholder_reuses_durable_message_for_same_run() {
        let materializer = Materializer::new();
        let run_id = Uuid::new_v4();
        let turn_id = Uuid::new_v4();

        let mut durable = ConversationMessage::agent_placeholder("conv-1", run_id, turn_id);
        durable.id = "m-7".to_string();
        materializer.push(durable);

        let bound =
            materializer.ensure_placeholder("conv-1", &placeholder_id(run_id), turn_id, false);
        assert_eq!(bound, "m-7");
        assert_eq!(materializer.snapshot("conv-1").len(), 1);
    }

    #[test]
    fn snapshots_are_copy_on_write() {
        let materializer = Materializer::new();
        let run_id = Uuid::new_v4();
        let id = materializer.ensure_placeholder(
            "conv-1",
            &placeholder_id(run_id),
            Uuid::new_v4(),
            false,
        );
        let before = materializer.snapshot("conv-1");
        materializer.append_text("conv-1", &id, "more");
        // The earlier snapshot is untouched by the mutation.
        assert_eq!(before[0].text, "");
        assert_eq!(materializer.snapshot("conv-1")[0].text, "more");
    }

    #[test]
    fn reconcile_adopts_durable_id_and_collapses_duplicates() {
        let materializer = Materializer::new();
        let run_id = Uuid::new_v4();
        let turn_id = Uuid::new_v4();
        let placeholder = placeholder_id(run_id);
        let id = materializer.ensure_placeholder("conv-1", &placeholder, turn_id, false);
        materializer.append_text("conv-1", &id, "streamed text");

        let mut durable = ConversationMessage::agent_placeholder("conv-1", run_id, turn_id);
        durable.id = "m-9".to_string();
        durable.text = "streamed text".to_string();

        let bound = materializer.reconcile("conv-1", &placeholder, &durable).unwrap();
        assert_eq!(bound, "m-9");
        let messages = materializer.snapshot("conv-1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m-9");
        assert_eq!(messages[0].text, "streamed text");
        // Still addressable by run after the id changed.
        assert!(materializer.message_for_run("conv-1", run_id).is_some());
    }

    #[test]
    fn update_by_run_finds_message_after_reconciliation() {
        let materializer = Materializer::new();
        let run_id = Uuid::new_v4();
        let turn_id = Uuid::new_v4();
        let placeholder = placeholder_id(run_id);
        materializer.ensure_placeholder("conv-1", &placeholder, turn_id, false);

        let mut durable = ConversationMessage::agent_placeholder("conv-1", run_id, turn_id);
        durable.id = "m-3".to_string();
        materializer.reconcile("conv-1", &placeholder, &durable);

        let id = materializer
            .update_by_run("conv-1", run_id, |m| m.text.push_str("after"))
            .unwrap();
        assert_eq!(id, "m-3");
        assert_eq!(materializer.snapshot("conv-1")[0].text, "after");
    }
}
