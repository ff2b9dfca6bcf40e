//! Shared request lifecycle for all backends.
//!
//! A backend supplies an [`EventDecoder`] that understands its wire frames;
//! [`spawn_stream`] does the rest: registers the request for cancellation,
//! forwards deltas, accumulates the raw answer, and finishes with exactly
//! one terminal event built by the response parser.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use pocketcode_core::error::ProviderError;
use pocketcode_core::stream::{StreamHandle, StreamSink, Usage, stream_channel};
use pocketcode_core::{ParsedResponse, parse_response};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::{Framing, HttpRequest, SseTransport, TransportEvent};

/// One unit of decoded backend output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    Text(String),
    Thinking(String),
    /// A natively streamed tool call begins at `index`.
    ToolStart { index: u32, name: String },
    /// More argument JSON for the tool call at `index`.
    ToolArgs { index: u32, fragment: String },
    Usage(Usage),
    /// The backend signalled the end of the message.
    Finished,
    /// The backend reported an error inside the stream.
    Failed(ProviderError),
}

/// Converts one backend's frames into [`Decoded`] items.
pub(crate) trait EventDecoder: Send + 'static {
    fn decode(&mut self, event: Option<&str>, data: &Value) -> Vec<Decoded>;
}

/// Request id -> cancellation token for every in-flight request.
#[derive(Debug, Default)]
pub struct ActiveStreams {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl ActiveStreams {
    pub fn insert(&self, request_id: &str, token: CancellationToken) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(request_id.to_string(), token);
        }
    }

    /// Cancel and forget a request. Unknown ids are a no-op.
    pub fn cancel(&self, request_id: &str) -> bool {
        let token = self.inner.lock().ok().and_then(|mut map| map.remove(request_id));
        match token {
            Some(token) => {
                token.cancel();
                debug!(request_id, "Cancelled stream");
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, request_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(request_id);
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(request_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    name: String,
    arguments: String,
}

/// Everything seen on one stream.
#[derive(Debug, Default)]
pub(crate) struct StreamAccumulator {
    text: String,
    thinking: String,
    tools: BTreeMap<u32, ToolCallAccumulator>,
}

impl StreamAccumulator {
    fn apply(&mut self, item: &Decoded) {
        match item {
            Decoded::Text(t) => self.text.push_str(t),
            Decoded::Thinking(t) => self.thinking.push_str(t),
            Decoded::ToolStart { index, name } => {
                let acc = self.tools.entry(*index).or_default();
                if !name.is_empty() {
                    acc.name = name.clone();
                }
            }
            Decoded::ToolArgs { index, fragment } => {
                self.tools.entry(*index).or_default().arguments.push_str(fragment);
            }
            _ => {}
        }
    }

    /// Raw answer text, with native tool calls re-encoded in the
    /// `[{"name", "args"}]` wire format so the parser recovers them.
    fn raw(&self) -> String {
        let calls: Vec<Value> = self
            .tools
            .values()
            .filter(|t| !t.name.is_empty())
            .map(|t| {
                let args = match serde_json::from_str::<Value>(&t.arguments) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                serde_json::json!({ "name": t.name, "args": args })
            })
            .collect();

        if calls.is_empty() {
            return self.text.clone();
        }
        let encoded = Value::Array(calls).to_string();
        if self.text.trim().is_empty() {
            encoded
        } else {
            format!("{}\n{}", self.text, encoded)
        }
    }

    pub(crate) fn finish(self) -> ParsedResponse {
        let raw = self.raw();
        let mut parsed = parse_response(&raw);
        if !parsed.is_valid {
            parsed.explanation = self.text;
        }
        parsed.raw_response = raw;
        parsed.thinking = self.thinking;
        parsed
    }
}

/// Run one request on its own task and return the caller's handle.
pub(crate) fn spawn_stream<D: EventDecoder>(
    transport: &SseTransport,
    active: &Arc<ActiveStreams>,
    request_id: &str,
    http: HttpRequest,
    framing: Framing,
    decoder: D,
) -> StreamHandle {
    let (sink, handle) = stream_channel(request_id);
    let token = sink.cancellation();
    active.insert(request_id, token.clone());

    // The connection closes once the stream ends; the caller's token stays
    // untouched so a buffered terminal event is still delivered.
    let connection = token.child_token();
    let events = transport.open(http, framing, connection.clone());
    let active = Arc::clone(active);
    let request_id = request_id.to_string();

    tokio::spawn(async move {
        drive(sink, events, decoder, token).await;
        connection.cancel();
        active.remove(&request_id);
    });

    handle
}

async fn drive<D: EventDecoder>(
    mut sink: StreamSink,
    mut events: tokio::sync::mpsc::Receiver<TransportEvent>,
    mut decoder: D,
    cancel: CancellationToken,
) {
    let mut acc = StreamAccumulator::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            // transport closed without a terminal: only happens on cancel
            None => {
                if cancel.is_cancelled() {
                    return;
                }
                break;
            }
            Some(TransportEvent::Opened) => {
                sink.started().await;
            }
            Some(TransportEvent::Frame { event, data }) => {
                let mut finished = false;
                for item in decoder.decode(event.as_deref(), &data) {
                    acc.apply(&item);
                    match item {
                        Decoded::Text(t) => {
                            sink.delta(t, false).await;
                        }
                        Decoded::Thinking(t) => {
                            sink.delta(t, true).await;
                        }
                        Decoded::Usage(u) => {
                            sink.usage(u).await;
                        }
                        Decoded::Finished => finished = true,
                        Decoded::Failed(err) => {
                            sink.fail(&err).await;
                            return;
                        }
                        Decoded::ToolStart { .. } | Decoded::ToolArgs { .. } => {}
                    }
                }
                if finished {
                    break;
                }
            }
            Some(TransportEvent::Done) => break,
            Some(TransportEvent::Failed(err)) => {
                sink.fail(&err).await;
                return;
            }
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    trace!(request_id = sink.request_id(), "Stream finished, parsing response");
    sink.complete(acc.finish()).await;
}
