//! Event Dispatcher: classifies inbound stream events and routes them into
//! the coalescer, materializer, and interrupt state.

use std::sync::Arc;

use uuid::Uuid;

use crate::events::RunStreamEvent;
use crate::types::{
    ActiveRunInfo, MessageMetadata, PendingInterrupt, RunStatus, ToolEvent, ToolEventStatus,
};

use super::interrupt::approval_banner;
use super::{EngineEvent, EngineInner};

/// Per-session progress the dispatcher accumulates for teardown.
#[derive(Debug, Default)]
pub(crate) struct SessionProgress {
    /// The server emitted its stream-completion hint.
    pub saw_done: bool,
}

/// Route one stream event. Runs to completion; all suspension points live at
/// the session loop's I/O boundary, not here.
pub(crate) fn dispatch_event(
    inner: &Arc<EngineInner>,
    info: &ActiveRunInfo,
    progress: &mut SessionProgress,
    event: RunStreamEvent,
) {
    let conversation_id = info.conversation_id.as_str();
    match event {
        RunStreamEvent::Keepalive => {
            tracing::trace!(run_id = %info.run_id, "keepalive");
        }
        RunStreamEvent::Policy {
            skill,
            requires_artifacts,
        } => {
            inner.materializer.update_by_run(conversation_id, info.run_id, |message| {
                let metadata = message.metadata.get_or_insert_with(MessageMetadata::default);
                if skill.is_some() {
                    metadata.skill = skill;
                }
                if requires_artifacts.is_some() {
                    metadata.requires_artifacts = requires_artifacts;
                }
            });
            inner.emit(EngineEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        RunStreamEvent::Thought { text } => {
            inner.materializer.update_by_run(conversation_id, info.run_id, |message| {
                message
                    .thinking_text
                    .get_or_insert_with(String::new)
                    .push_str(&text);
            });
            inner.emit(EngineEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        RunStreamEvent::ToolStart { id, name } => {
            clear_pending_interrupt(inner, info);
            let event_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            inner.materializer.update_by_run(conversation_id, info.run_id, |message| {
                message.tool_events.push(ToolEvent::running(event_id, name));
            });
            inner.emit(EngineEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        RunStreamEvent::ToolEnd {
            id,
            name,
            summary,
            output_files,
        } => {
            clear_pending_interrupt(inner, info);
            let summary = summary
                .map(|s| truncate_summary(&s, inner.config.tool_summary_max_chars));
            close_tool_event(
                inner,
                info,
                id.as_deref(),
                &name,
                ToolEventStatus::Completed,
                summary,
                output_files,
            );
        }
        RunStreamEvent::ToolError { id, name, message } => {
            clear_pending_interrupt(inner, info);
            let summary = Some(truncate_summary(&message, inner.config.tool_summary_max_chars));
            close_tool_event(
                inner,
                info,
                id.as_deref(),
                &name,
                ToolEventStatus::Error,
                summary,
                Vec::new(),
            );
        }
        RunStreamEvent::Interrupt {
            action_requests,
            review_configs,
        } => {
            let pending = PendingInterrupt {
                action_requests,
                review_configs,
            };
            // Flush buffered tokens first so the banner lands after them.
            inner.flush_conversation(conversation_id);
            let banner = approval_banner(&pending);
            inner.materializer.update_by_run(conversation_id, info.run_id, |message| {
                message.status = Some(RunStatus::AwaitingApproval);
                message
                    .metadata
                    .get_or_insert_with(MessageMetadata::default)
                    .pending_interrupt = Some(pending);
                message.text.push_str(&banner);
            });
            if let Some(mut registered) = inner.registry.get(info.run_id) {
                registered.status = RunStatus::AwaitingApproval;
                inner.registry.register(registered);
            }
            inner.emit(EngineEvent::ApprovalRequired {
                conversation_id: conversation_id.to_string(),
                run_id: info.run_id,
            });
            inner.emit(EngineEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        RunStreamEvent::Token { text, role } => {
            if !RunStreamEvent::is_assistant_role(role.as_deref()) {
                return;
            }
            clear_pending_interrupt(inner, info);
            inner.coalescer.push(conversation_id, &text);
        }
        RunStreamEvent::ContractError {
            message,
            missing_fields,
        } => {
            inner.flush_conversation(conversation_id);
            let note = if missing_fields.is_empty() {
                format!("\n[Contract error] {message}")
            } else {
                format!(
                    "\n[Contract error] {message} (missing: {})",
                    missing_fields.join(", ")
                )
            };
            inner.materializer.update_by_run(conversation_id, info.run_id, |m| {
                m.text.push_str(&note);
            });
            inner.emit(EngineEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        RunStreamEvent::Error { message } => {
            // Inline, non-fatal; termination is driven by stream closure.
            inner.flush_conversation(conversation_id);
            inner.materializer.update_by_run(conversation_id, info.run_id, |m| {
                m.text.push_str(&format!("\n[Error] {message}"));
            });
            inner.emit(EngineEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        RunStreamEvent::Done => {
            progress.saw_done = true;
        }
    }
}

/// New tool or token activity means the gate reopened.
fn clear_pending_interrupt(inner: &Arc<EngineInner>, info: &ActiveRunInfo) {
    // Fast path: nothing pending. Keeps the token hot path free of
    // copy-on-write mutations.
    if !inner.materializer.is_gated(&info.conversation_id, info.run_id) {
        return;
    }
    inner.materializer.update_by_run(&info.conversation_id, info.run_id, |message| {
        if let Some(metadata) = message.metadata.as_mut() {
            metadata.pending_interrupt = None;
        }
        if message.status == Some(RunStatus::AwaitingApproval) {
            message.status = Some(RunStatus::Running);
        }
    });
    if let Some(mut registered) = inner.registry.get(info.run_id) {
        if registered.status == RunStatus::AwaitingApproval {
            registered.status = RunStatus::Running;
            inner.registry.register(registered);
        }
    }
}

/// Close the most recent running tool event of matching shape, or append a
/// closed one when no `tool_start` was seen (defensive against lost starts).
fn close_tool_event(
    inner: &Arc<EngineInner>,
    info: &ActiveRunInfo,
    id: Option<&str>,
    name: &str,
    status: ToolEventStatus,
    summary: Option<String>,
    output_files: Vec<String>,
) {
    inner.materializer.update_by_run(&info.conversation_id, info.run_id, |message| {
        let position = message.tool_events.iter().rposition(|event| {
            event.status == ToolEventStatus::Running
                && match id {
                    Some(id) => event.id == id,
                    None => event.name == name,
                }
        });
        match position {
            Some(index) => {
                let event = &mut message.tool_events[index];
                event.status = status;
                event.finished_at = Some(chrono::Utc::now());
                event.summary = summary;
                event.output_files = output_files;
            }
            None => {
                let mut event = ToolEvent::running(
                    id.map(str::to_string)
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    name,
                );
                event.status = status;
                event.finished_at = Some(chrono::Utc::now());
                event.summary = summary;
                event.output_files = output_files;
                message.tool_events.push(event);
            }
        }
    });
    inner.emit(EngineEvent::MessagesUpdated {
        conversation_id: info.conversation_id.clone(),
    });
}

/// Char-safe truncation for tool summaries.
pub(crate) fn truncate_summary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}
