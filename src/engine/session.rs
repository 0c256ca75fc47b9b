//! Stream Session: the lifecycle of one live event stream.
//!
//! At most one session exists per conversation; opening a replacement aborts
//! the old one synchronously, before the new stream is requested. A session
//! owns its abort token and unconditionally runs teardown on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::types::{ActiveRunInfo, RunId, RunStatus};

use super::dispatch::{dispatch_event, SessionProgress};
use super::{EngineEvent, EngineInner};

pub(crate) struct SessionHandle {
    pub seq: u64,
    pub run_id: RunId,
    pub cancel: CancellationToken,
    pub stop_requested: Arc<AtomicBool>,
}

/// Materialize the placeholder, bind the coalescer, replace any existing
/// session for the conversation, and spawn the stream consumer.
pub(crate) fn open_session(
    inner: &Arc<EngineInner>,
    info: ActiveRunInfo,
    prompt: Option<String>,
    reset_text: bool,
) {
    let bound = inner.materializer.ensure_placeholder(
        &info.conversation_id,
        &info.placeholder_id,
        info.turn_id,
        reset_text,
    );
    inner.coalescer.bind(&info.conversation_id, &bound, prompt);

    let seq = inner.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
    let cancel = inner.shutdown.child_token();
    let stop_requested = Arc::new(AtomicBool::new(false));
    let handle = SessionHandle {
        seq,
        run_id: info.run_id,
        cancel: cancel.clone(),
        stop_requested: Arc::clone(&stop_requested),
    };
    {
        let mut sessions = inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = sessions.remove(&info.conversation_id) {
            old.cancel.cancel();
        }
        sessions.insert(info.conversation_id.clone(), handle);
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        run_session(inner, info, cancel, stop_requested, seq).await;
    });
}

async fn run_session(
    inner: Arc<EngineInner>,
    info: ActiveRunInfo,
    cancel: CancellationToken,
    stop_requested: Arc<AtomicBool>,
    seq: u64,
) {
    tracing::debug!(run_id = %info.run_id, conversation_id = %info.conversation_id, "session opened");
    spawn_workspace_poll(&inner, &info, &cancel);

    let mut progress = SessionProgress::default();
    let mut aborted = false;
    let mut stream_failure: Option<String> = None;

    match inner.transport.open_stream(info.run_id).await {
        Ok(mut stream) => loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    aborted = true;
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => dispatch_event(&inner, &info, &mut progress, event),
                    Some(Err(err)) => {
                        stream_failure = Some(err.to_string());
                        break;
                    }
                    None => break,
                },
            }
        },
        Err(err) => {
            stream_failure = Some(err.to_string());
        }
    }

    // Stops the workspace poll on natural exit too.
    cancel.cancel();
    let stop = stop_requested.load(Ordering::Relaxed);
    finalize_session(&inner, &info, aborted, stop, stream_failure, &progress, seq).await;
}

async fn finalize_session(
    inner: &Arc<EngineInner>,
    info: &ActiveRunInfo,
    aborted: bool,
    stop_requested: bool,
    stream_failure: Option<String>,
    progress: &SessionProgress,
    seq: u64,
) {
    let conversation_id = info.conversation_id.as_str();
    inner.flush_conversation(conversation_id);

    if aborted {
        let marker = if stop_requested {
            "\n[Stopped by user]"
        } else {
            "\n[Stream cancelled]"
        };
        inner.materializer.update_by_run(conversation_id, info.run_id, |m| {
            m.text.push_str(marker);
        });
    } else if let Some(reason) = &stream_failure {
        tracing::warn!(run_id = %info.run_id, %reason, "stream failed");
        inner.materializer.update_by_run(conversation_id, info.run_id, |m| {
            m.text.push_str("\n[Stream failed]");
        });
    }

    let final_status = resolve_final_status(
        inner,
        info,
        aborted,
        stop_requested,
        stream_failure.is_some(),
        progress,
    )
    .await;

    inner.materializer.update_by_run(conversation_id, info.run_id, |m| {
        m.status = Some(final_status);
        if final_status.is_terminal() {
            if let Some(metadata) = m.metadata.as_mut() {
                metadata.pending_interrupt = None;
            }
        }
    });

    let mut final_info = info.clone();
    final_info.status = final_status;
    if let Err(err) = inner
        .persister
        .persist(
            &inner.store,
            &inner.materializer,
            &inner.coalescer,
            &final_info,
            Some(final_status),
        )
        .await
    {
        tracing::warn!(run_id = %info.run_id, %err, "final checkpoint failed");
    }

    if final_status.is_terminal() {
        inner.registry.remove(info.run_id);
        inner.persister.forget(info.run_id);
    } else {
        inner.registry.register(final_info);
    }

    // Only tear down the map entry if it is still ours; a replacement session
    // may already have taken the slot.
    {
        let mut sessions = inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.get(conversation_id).is_some_and(|h| h.seq == seq) {
            sessions.remove(conversation_id);
            inner.coalescer.unbind(conversation_id);
        }
    }

    tracing::debug!(run_id = %info.run_id, status = %final_status, "session closed");
    inner.emit(EngineEvent::RunFinished {
        conversation_id: conversation_id.to_string(),
        run_id: info.run_id,
        status: final_status,
    });
    inner.emit(EngineEvent::MessagesUpdated {
        conversation_id: conversation_id.to_string(),
    });
}

/// The stream's termination reason is a hint; fetch authoritative status once
/// and let it win unless the server is still catching up to a local abort.
///
/// Only a user-requested stop may coerce an active run to `Cancelled`. Any
/// other abort (engine shutdown, session replacement) leaves a still-running
/// run non-terminal so it stays registered and resumable.
async fn resolve_final_status(
    inner: &Arc<EngineInner>,
    info: &ActiveRunInfo,
    aborted: bool,
    stop_requested: bool,
    failed: bool,
    progress: &SessionProgress,
) -> RunStatus {
    let hinted = if stop_requested {
        RunStatus::Cancelled
    } else if aborted {
        RunStatus::Running
    } else if failed {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    match inner.transport.run_status(info.run_id).await {
        Ok(status) if status.is_terminal() || status == RunStatus::AwaitingApproval => status,
        Ok(status) => {
            // Server still reports the run active. After a user stop that is
            // just cancellation lag; after a clean close with a completion
            // hint, trust the hint. Any other abort keeps the server's word.
            if stop_requested || progress.saw_done {
                hinted
            } else {
                status
            }
        }
        Err(err) => {
            tracing::warn!(run_id = %info.run_id, %err, "status fetch failed, using stream hint");
            hinted
        }
    }
}

fn spawn_workspace_poll(
    inner: &Arc<EngineInner>,
    info: &ActiveRunInfo,
    cancel: &CancellationToken,
) {
    let Some(watcher) = inner.watcher.get() else {
        return;
    };
    if info.workspace_id.is_empty() {
        return;
    }
    let watcher = Arc::clone(watcher);
    let workspace_id = info.workspace_id.clone();
    let token = cancel.clone();
    let interval = inner.config.workspace_poll_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate first tick
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => watcher.refresh(&workspace_id).await,
            }
        }
    });
}
