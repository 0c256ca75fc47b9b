//! Chunk Coalescer: batches high-frequency token chunks into fixed-interval
//! flushes.
//!
//! Streaming tokens can arrive faster than a consumer can usefully redraw;
//! buffering and flushing on a shared tick bounds update frequency
//! independent of token rate while preserving full ordering and content.
//! The concatenation of flushed pieces equals the concatenation of raw
//! chunks, modulo the one-time echo strip.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::EchoSuppression;

/// Buffered, not-yet-materialized text for one conversation's active message.
#[derive(Debug)]
struct PendingChunk {
    message_id: String,
    text: String,
    /// Trimmed prompt for this turn; consulted once on the first flush.
    prompt: Option<String>,
    echo_checked: bool,
}

/// A flushed piece ready to be appended by the materializer.
#[derive(Debug, PartialEq)]
pub(crate) struct FlushedChunk {
    pub conversation_id: String,
    pub message_id: String,
    pub text: String,
}

/// Per-conversation chunk buffers, drained by the shared flush tick.
#[derive(Debug, Default)]
pub(crate) struct ChunkCoalescer {
    buffers: Mutex<HashMap<String, PendingChunk>>,
    echo_suppression: EchoSuppression,
}

impl ChunkCoalescer {
    pub fn new(echo_suppression: EchoSuppression) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            echo_suppression,
        }
    }

    /// Bind a conversation's buffer to the message chunks should flush into.
    /// Any previous buffer for the conversation is discarded.
    pub fn bind(&self, conversation_id: &str, message_id: &str, prompt: Option<String>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.insert(
            conversation_id.to_string(),
            PendingChunk {
                message_id: message_id.to_string(),
                text: String::new(),
                prompt: prompt.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()),
                echo_checked: false,
            },
        );
    }

    /// Retarget a bound buffer after the placeholder id is reconciled with a
    /// durable id.
    pub fn rebind_message(&self, conversation_id: &str, message_id: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = buffers.get_mut(conversation_id) {
            pending.message_id = message_id.to_string();
        }
    }

    /// Append a raw chunk. Dropped if the conversation has no bound buffer.
    pub fn push(&self, conversation_id: &str, text: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = buffers.get_mut(conversation_id) {
            pending.text.push_str(text);
        }
    }

    /// Drain every non-empty buffer across all conversations, applying the
    /// echo-suppression check on a message's first flushed text.
    pub fn take_all(&self) -> Vec<FlushedChunk> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut flushed = Vec::new();
        for (conversation_id, pending) in buffers.iter_mut() {
            if pending.text.is_empty() {
                continue;
            }
            let mut text = std::mem::take(&mut pending.text);
            if !pending.echo_checked {
                pending.echo_checked = true;
                if self.echo_suppression == EchoSuppression::StripLeadingPrompt {
                    if let Some(prompt) = pending.prompt.as_deref() {
                        if let Some(stripped) = text.strip_prefix(prompt) {
                            text = stripped.to_string();
                        }
                    }
                }
                if text.is_empty() {
                    continue;
                }
            }
            flushed.push(FlushedChunk {
                conversation_id: conversation_id.clone(),
                message_id: pending.message_id.clone(),
                text,
            });
        }
        flushed
    }

    /// Drain just one conversation's buffer, for in-order appends (approval
    /// banners, terminal markers) and the final flush at session end.
    pub fn take_conversation(&self, conversation_id: &str) -> Option<FlushedChunk> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let pending = buffers.get_mut(conversation_id)?;
        if pending.text.is_empty() {
            return None;
        }
        let mut text = std::mem::take(&mut pending.text);
        if !pending.echo_checked {
            pending.echo_checked = true;
            if self.echo_suppression == EchoSuppression::StripLeadingPrompt {
                if let Some(prompt) = pending.prompt.as_deref() {
                    if let Some(stripped) = text.strip_prefix(prompt) {
                        text = stripped.to_string();
                    }
                }
            }
            if text.is_empty() {
                return None;
            }
        }
        Some(FlushedChunk {
            conversation_id: conversation_id.to_string(),
            message_id: pending.message_id.clone(),
            text,
        })
    }

    /// Drop a conversation's buffer entirely (session torn down).
    pub fn unbind(&self, conversation_id: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.remove(conversation_id);
    }
}
