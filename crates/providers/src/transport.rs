//! Streaming HTTP transport.
//!
//! Opens a POST request and turns the response body into framed JSON
//! events as bytes arrive. Two framings are supported: server-sent events
//! (`event:` / `data:` lines, blank-line dispatch, `[DONE]` sentinel) and
//! newline-delimited JSON. Partial lines are buffered as raw bytes, so a
//! UTF-8 sequence split across reads is decoded only once complete.
//!
//! Body reads are unbounded. Connecting and sending the request, up to the
//! response head, are bounded.

use std::time::Duration;

use futures::StreamExt;
use pocketcode_core::error::ProviderError;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const EVENT_BUFFER: usize = 64;

/// Body framing of a streaming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Sse,
    NdJson,
}

/// A streaming request: `{url, headers, JSON body}`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Events produced by an open connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Response headers arrived with a success status.
    Opened,
    /// One complete JSON frame. `event` is the SSE event name, if any.
    Frame { event: Option<String>, data: Value },
    /// The body ended normally (or with `[DONE]`).
    Done,
    /// Terminal failure. Nothing follows.
    Failed(ProviderError),
}

/// Shared HTTP client for streaming requests.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    send_timeout: Duration,
}

impl SseTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, ProviderError> {
        // no total timeout: a response may stream for minutes
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            send_timeout: connect_timeout,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Open a streaming request. The returned receiver yields at most one
    /// `Done` or `Failed`; when `cancel` fires the connection is dropped and
    /// the receiver closes without a terminal event.
    pub fn open(
        &self,
        request: HttpRequest,
        framing: Framing,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.client.clone();
        let send_timeout = self.send_timeout;

        tokio::spawn(async move {
            let url = request.url.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(url = %url, "Stream cancelled");
                }
                _ = run(client, request, framing, send_timeout, tx) => {}
            }
        });

        rx
    }
}

async fn run(
    client: reqwest::Client,
    request: HttpRequest,
    framing: Framing,
    send_timeout: Duration,
    tx: mpsc::Sender<TransportEvent>,
) {
    let mut builder = client
        .post(&request.url)
        .header("Content-Type", "application/json")
        .json(&request.body);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if framing == Framing::Sse {
        builder = builder.header("Accept", "text/event-stream");
    }

    let response = match tokio::time::timeout(send_timeout, builder.send()).await {
        Ok(Ok(r)) => r,
        Err(_) => {
            warn!(url = %request.url, ?send_timeout, "No response head before timeout");
            let err = ProviderError::Timeout(format!(
                "no response within {}s",
                send_timeout.as_secs_f32()
            ));
            let _ = tx.send(TransportEvent::Failed(err)).await;
            return;
        }
        Ok(Err(e)) => {
            let err = if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            };
            let _ = tx.send(TransportEvent::Failed(err)).await;
            return;
        }
    };

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        warn!(status, body = %body, "Streaming request rejected");
        let _ = tx
            .send(TransportEvent::Failed(status_error(status, retry_after, body)))
            .await;
        return;
    }

    if tx.send(TransportEvent::Opened).await.is_err() {
        return;
    }

    let mut byte_stream = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut decoder = FrameDecoder::new(framing);

    while let Some(chunk) = byte_stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(TransportEvent::Failed(ProviderError::StreamInterrupted(
                        e.to_string(),
                    )))
                    .await;
                return;
            }
        };

        lines.push(&bytes);
        while let Some(line) = lines.next_line() {
            match decoder.line(&line) {
                Step::Continue => {}
                Step::Emit(event) => {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Step::Done => {
                    let _ = tx.send(TransportEvent::Done).await;
                    return;
                }
            }
        }
    }

    // EOF: flush a trailing line without newline, then any pending event
    if let Some(line) = lines.take_rest() {
        match decoder.line(&line) {
            Step::Emit(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Step::Done => {
                let _ = tx.send(TransportEvent::Done).await;
                return;
            }
            Step::Continue => {}
        }
    }
    if let Step::Emit(event) = decoder.flush() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
    let _ = tx.send(TransportEvent::Done).await;
}

/// Map a non-success HTTP status onto the provider error taxonomy.
pub fn status_error(status: u16, retry_after: Option<u64>, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(5),
        },
        401 | 403 => ProviderError::AuthenticationFailed(if body.is_empty() {
            format!("HTTP {status}")
        } else {
            body
        }),
        404 => ProviderError::ModelNotFound(body),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

/// Byte buffer that yields complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Some(String::from_utf8_lossy(line).into_owned())
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest);
        Some(String::from_utf8_lossy(rest).into_owned())
    }
}

enum Step {
    Continue,
    Emit(TransportEvent),
    Done,
}

/// Turns lines into frames for one framing.
struct FrameDecoder {
    framing: Framing,
    event: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    fn new(framing: Framing) -> Self {
        Self {
            framing,
            event: None,
            data: Vec::new(),
        }
    }

    fn line(&mut self, line: &str) -> Step {
        match self.framing {
            Framing::NdJson => {
                let line = line.trim();
                if line.is_empty() {
                    return Step::Continue;
                }
                parse_frame(None, line)
            }
            Framing::Sse => self.sse_line(line),
        }
    }

    fn sse_line(&mut self, line: &str) -> Step {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return Step::Continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => {
                // a new event name without a blank line closes the previous one
                let pending = if self.data.is_empty() {
                    Step::Continue
                } else {
                    self.flush()
                };
                self.event = Some(value.trim().to_string());
                pending
            }
            "data" => {
                self.data.push(value.to_string());
                Step::Continue
            }
            _ => Step::Continue,
        }
    }

    fn flush(&mut self) -> Step {
        let event = self.event.take();
        if self.data.is_empty() {
            return Step::Continue;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let data = data.trim();
        if data == "[DONE]" {
            return Step::Done;
        }
        parse_frame(event, data)
    }
}

fn parse_frame(event: Option<String>, data: &str) -> Step {
    match serde_json::from_str::<Value>(data) {
        Ok(data) => Step::Emit(TransportEvent::Frame { event, data }),
        Err(e) => {
            trace!(error = %e, data = %data, "Ignoring unparseable stream frame");
            Step::Continue
        }
    }
}
