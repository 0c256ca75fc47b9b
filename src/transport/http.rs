//! HTTP client for the agent run service.
//!
//! The service speaks JSON over plain POST/GET endpoints and streams run
//! events as newline-delimited JSON (`application/jsonl`). Line framing is
//! handled here; event decoding lives in [`RunStreamEvent::parse_line`].

use std::sync::OnceLock;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::error::TetherError;
use crate::events::{DecisionBody, RunStreamEvent};
use crate::types::{
    ConversationMessage, DecisionKind, MessageMetadata, RunId, RunStatus, Sender, ToolEvent,
    TurnId,
};

use super::{
    AppendMessage, ConversationDetail, ConversationStore, EventStream, RunStarted, RunTransport,
    StartRunRequest, WorkspaceWatcher,
};

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// No overall request timeout: event streams stay open for the lifetime of a
/// run. Connect timeout still applies.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Map an HTTP error status to a transport error.
fn status_to_error(status: u16, body: &str) -> TetherError {
    match status {
        404 => TetherError::api(status, format!("not found: {body}")),
        _ => TetherError::api(status, body),
    }
}

/// [`RunTransport`] implementation over the agent service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: shared_client().clone(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TetherError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_to_error(status.as_u16(), &body))
    }
}

#[derive(Serialize)]
struct DecisionRequest<'a> {
    decision: DecisionKind,
    #[serde(flatten)]
    body: &'a DecisionBody,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: RunStatus,
}

#[async_trait]
impl RunTransport for HttpTransport {
    async fn start_run(&self, request: StartRunRequest) -> Result<RunStarted, TetherError> {
        let response = self
            .client
            .post(self.url("/runs"))
            .json(&request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json::<RunStarted>().await?)
    }

    async fn open_stream(&self, run_id: RunId) -> Result<EventStream, TetherError> {
        let response = self
            .client
            .get(self.url(&format!("/runs/{run_id}/events")))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let chunks = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(TetherError::from);
        Ok(Box::pin(decode_jsonl(chunks)))
    }

    async fn run_status(&self, run_id: RunId) -> Result<RunStatus, TetherError> {
        let response = self
            .client
            .get(self.url(&format!("/runs/{run_id}")))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json::<StatusResponse>().await?.status)
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<(), TetherError> {
        let response = self
            .client
            .post(self.url(&format!("/runs/{run_id}/cancel")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn submit_decision(
        &self,
        run_id: RunId,
        decision: DecisionKind,
        body: DecisionBody,
    ) -> Result<(), TetherError> {
        let response = self
            .client
            .post(self.url(&format!("/runs/{run_id}/decision")))
            .json(&DecisionRequest {
                decision,
                body: &body,
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct AppendMessageRequest {
    sender: Sender,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_events: Vec<ToolEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_id: Option<TurnId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<MessageMetadata>,
    replace_existing: bool,
}

#[derive(Deserialize)]
struct ConversationResponse {
    #[serde(default)]
    messages: Vec<ConversationMessage>,
}

#[async_trait]
impl ConversationStore for HttpTransport {
    async fn append_message(
        &self,
        request: AppendMessage,
    ) -> Result<ConversationMessage, TetherError> {
        let conversation_id = request.conversation_id.clone();
        let body = AppendMessageRequest {
            sender: request.sender,
            text: request.text,
            thinking_text: request.thinking_text,
            tool_events: request.tool_events,
            turn_id: request.turn_id,
            run_id: request.run_id,
            status: request.status,
            metadata: request.metadata,
            replace_existing: request.replace_existing,
        };
        let response = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/messages")))
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json::<ConversationMessage>().await?)
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationDetail, TetherError> {
        let response = self
            .client
            .get(self.url(&format!("/conversations/{conversation_id}")))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let body = response.json::<ConversationResponse>().await?;
        Ok(ConversationDetail {
            conversation_id: conversation_id.to_string(),
            messages: body.messages,
        })
    }
}

#[async_trait]
impl WorkspaceWatcher for HttpTransport {
    /// Best-effort workspace refresh; failures are logged and the next poll
    /// tries again.
    async fn refresh(&self, workspace_id: &str) {
        let result = self
            .client
            .post(self.url(&format!("/workspaces/{workspace_id}/refresh")))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::debug!(workspace_id, status = %response.status(), "workspace refresh rejected");
            }
            Err(err) => {
                tracing::debug!(workspace_id, %err, "workspace refresh failed");
            }
            _ => {}
        }
    }
}

/// Decode a byte-chunk stream into typed run events, one per JSONL line.
/// Unknown event types are skipped; a transport error ends the stream after
/// being yielded.
pub(crate) fn decode_jsonl<S>(chunks: S) -> impl Stream<Item = Result<RunStreamEvent, TetherError>>
where
    S: Stream<Item = Result<Vec<u8>, TetherError>> + Send + Unpin + 'static,
{
    struct Decoder<S> {
        chunks: S,
        buf: Vec<u8>,
        done: bool,
    }

    impl<S> Decoder<S>
    where
        S: Stream<Item = Result<Vec<u8>, TetherError>> + Send + Unpin,
    {
        fn take_line(&mut self) -> Option<String> {
            let pos = self.buf.iter().position(|&b| b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            Some(String::from_utf8_lossy(&line).into_owned())
        }

        async fn next_event(&mut self) -> Option<Result<RunStreamEvent, TetherError>> {
            loop {
                while let Some(line) = self.take_line() {
                    if let Some(event) = RunStreamEvent::parse_line(&line) {
                        return Some(Ok(event));
                    }
                }
                if self.done {
                    // Trailing partial line at end of stream.
                    if self.buf.is_empty() {
                        return None;
                    }
                    let rest = String::from_utf8_lossy(&self.buf).into_owned();
                    self.buf.clear();
                    return RunStreamEvent::parse_line(&rest).map(Ok);
                }
                match self.chunks.next().await {
                    Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                    Some(Err(err)) => {
                        self.done = true;
                        self.buf.clear();
                        return Some(Err(err));
                    }
                    None => self.done = true,
                }
            }
        }
    }

    futures::stream::unfold(
        Decoder {
            chunks,
            buf: Vec::new(),
            done: false,
        },
        |mut decoder| async move {
            let event = decoder.next_event().await?;
            Some((event, decoder))
        },
    )
}
