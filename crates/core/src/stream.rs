//! Per-request streaming contract between a provider client and its caller.
//!
//! Every call to `ProviderClient::send_message_streaming` produces a
//! [`StreamHandle`] (the receiving half) and a [`StreamSink`] (the sending
//! half, owned by the backend task). The sink's terminal methods consume it,
//! so a request can deliver at most one `Completed` or `Error`. Both halves
//! share a cancellation token; once it fires the handle yields nothing more.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::message::Message;
use crate::provider::ModelInfo;
use crate::response::ParsedResponse;
use crate::tool::ToolDefinition;

const STREAM_BUFFER: usize = 256;

/// One streaming request. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub request_id: String,
    pub model: ModelInfo,
    pub user_message: String,
    /// History preceding `user_message`, already windowed by the caller
    pub history: Vec<Message>,
    pub thinking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl StreamRequest {
    pub fn new(model: ModelInfo, user_message: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            thinking: model.thinking,
            model,
            user_message: user_message.into(),
            history: Vec::new(),
            system_prompt: None,
            tools: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_thinking(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token counts reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Clamp a wire-reported count into range.
    pub fn count(n: u64) -> u32 {
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

/// Lifecycle events for one request, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Started,
    Delta { text: String, is_thinking: bool },
    Usage(Usage),
    Error { message: String, code: String },
    Completed(ParsedResponse),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Completed(_))
    }
}

/// Receiving half of a request's event stream.
#[derive(Debug)]
pub struct StreamHandle {
    pub request_id: String,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamHandle {
    /// Next event, or `None` once the sink is gone (terminal delivered) or
    /// the request was cancelled.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Sending half of a request's event stream.
#[derive(Debug)]
pub struct StreamSink {
    request_id: String,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    started: bool,
}

/// Create the paired sink and handle for one request.
pub fn stream_channel(request_id: impl Into<String>) -> (StreamSink, StreamHandle) {
    let request_id = request_id.into();
    let (tx, events) = mpsc::channel(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    (
        StreamSink {
            request_id: request_id.clone(),
            tx,
            cancel: cancel.clone(),
            started: false,
        },
        StreamHandle {
            request_id,
            events,
            cancel,
        },
    )
}

impl StreamSink {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Token that cancels this request. Provider clients keep a clone in
    /// their active-request map.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the caller has dropped its handle or cancelled the request.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }

    /// Emit `Started`. Repeated calls are ignored.
    pub async fn started(&mut self) -> bool {
        if self.started {
            return !self.is_closed();
        }
        self.started = true;
        self.send(StreamEvent::Started).await
    }

    /// Emit a text delta. Empty fragments are dropped.
    pub async fn delta(&mut self, text: impl Into<String>, is_thinking: bool) -> bool {
        let text = text.into();
        if text.is_empty() {
            return !self.is_closed();
        }
        self.send(StreamEvent::Delta { text, is_thinking }).await
    }

    pub async fn usage(&mut self, usage: Usage) -> bool {
        self.send(StreamEvent::Usage(usage)).await
    }

    /// Terminal success.
    pub async fn complete(self, parsed: ParsedResponse) {
        self.send(StreamEvent::Completed(parsed)).await;
    }

    /// Terminal failure.
    pub async fn fail(self, err: &ProviderError) {
        self.send(StreamEvent::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        })
        .await;
    }

    async fn send(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }
}
