//! Native messages-protocol backend.
//!
//! Speaks the Anthropic Messages API directly:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field
//! - Typed SSE events (`content_block_delta`, `message_delta`, ...)
//! - Extended thinking via `thinking_delta` blocks

use std::sync::Arc;

use async_trait::async_trait;
use pocketcode_core::error::ProviderError;
use pocketcode_core::message::{Message, Role};
use pocketcode_core::provider::ProviderClient;
use pocketcode_core::stream::{StreamHandle, StreamRequest, Usage};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::streaming::{ActiveStreams, Decoded, EventDecoder, spawn_stream};
use crate::transport::{Framing, HttpRequest, SseTransport, status_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Native messages API client.
pub struct NativeClient {
    name: String,
    base_url: String,
    api_key: String,
    max_tokens: u32,
    thinking_budget: u32,
    transport: SseTransport,
    active: Arc<ActiveStreams>,
}

impl NativeClient {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>, transport: SseTransport) -> Self {
        Self {
            name: name.into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            thinking_budget: 4096,
            transport,
            active: Arc::new(ActiveStreams::default()),
        }
    }

    /// Custom base URL (proxies, tests). Must include the version segment.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_thinking_budget(mut self, budget: u32) -> Self {
        self.thinking_budget = budget;
        self
    }

    fn build_body(&self, request: &StreamRequest) -> Value {
        let (system, messages) = to_api_messages(&request.history, request.system_prompt.as_deref());
        let mut messages = messages;
        messages.push(ApiMessage {
            role: "user",
            content: request.user_message.clone(),
        });

        let mut body = json!({
            "model": request.model.id,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": true,
        });

        if let Some(system) = system {
            body["system"] = json!(system);
        }

        if request.thinking {
            // the thinking budget must leave room for the answer
            let max_tokens = self.max_tokens.max(self.thinking_budget + 1024);
            body["max_tokens"] = json!(max_tokens);
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": self.thinking_budget,
            });
        }

        body
    }

    fn headers(&self, http: HttpRequest) -> HttpRequest {
        http.header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

/// Split system messages out of the history; they join the system prompt.
fn to_api_messages(history: &[Message], system_prompt: Option<&str>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system_parts: Vec<&str> = system_prompt.into_iter().collect();
    let mut messages = Vec::new();

    for msg in history {
        match msg.role {
            Role::System => system_parts.push(&msg.content),
            Role::User => messages.push(ApiMessage {
                role: "user",
                content: msg.content.clone(),
            }),
            Role::Assistant => messages.push(ApiMessage {
                role: "assistant",
                content: msg.content.clone(),
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, messages)
}

#[async_trait]
impl ProviderClient for NativeClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_message_streaming(&self, request: StreamRequest) -> StreamHandle {
        debug!(
            provider = %self.name,
            model = %request.model.id,
            request_id = %request.request_id,
            thinking = request.thinking,
            "Sending streaming request"
        );
        let http = self.headers(HttpRequest::new(
            format!("{}/messages", self.base_url),
            self.build_body(&request),
        ));
        spawn_stream(
            &self.transport,
            &self.active,
            &request.request_id,
            http,
            Framing::Sse,
            NativeDecoder::default(),
        )
    }

    fn cancel_streaming(&self, request_id: &str) -> bool {
        self.active.cancel(request_id)
    }

    fn active_requests(&self) -> usize {
        self.active.len()
    }

    async fn fetch_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let response = self
            .transport
            .client()
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, None, body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(model_ids(&body["data"], "id"))
    }
}

pub(crate) fn model_ids(list: &Value, key: &str) -> Vec<String> {
    list.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m[key].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Decoder for the typed SSE events of the messages API.
#[derive(Debug, Default)]
struct NativeDecoder {
    input_tokens: u32,
}

impl EventDecoder for NativeDecoder {
    fn decode(&mut self, event: Option<&str>, data: &Value) -> Vec<Decoded> {
        let event_type = data["type"].as_str().or(event).unwrap_or("");

        match event_type {
            "message_start" => {
                if let Some(n) = data["message"]["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = Usage::count(n);
                }
                Vec::new()
            }
            "content_block_start" => {
                let block = &data["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let index = data["index"].as_u64().unwrap_or(0) as u32;
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    vec![Decoded::ToolStart { index, name }]
                } else {
                    Vec::new()
                }
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => delta["text"]
                        .as_str()
                        .map(|t| vec![Decoded::Text(t.to_string())])
                        .unwrap_or_default(),
                    "thinking_delta" => delta["thinking"]
                        .as_str()
                        .map(|t| vec![Decoded::Thinking(t.to_string())])
                        .unwrap_or_default(),
                    "input_json_delta" => {
                        let index = data["index"].as_u64().unwrap_or(0) as u32;
                        delta["partial_json"]
                            .as_str()
                            .map(|f| {
                                vec![Decoded::ToolArgs {
                                    index,
                                    fragment: f.to_string(),
                                }]
                            })
                            .unwrap_or_default()
                    }
                    _ => Vec::new(),
                }
            }
            "message_delta" => match data["usage"]["output_tokens"].as_u64() {
                Some(out) => vec![Decoded::Usage(Usage {
                    input_tokens: data["usage"]["input_tokens"]
                        .as_u64()
                        .map(Usage::count)
                        .unwrap_or(self.input_tokens),
                    output_tokens: Usage::count(out),
                })],
                None => Vec::new(),
            },
            "message_stop" => vec![Decoded::Finished],
            "error" => {
                let kind = data["error"]["type"].as_str().unwrap_or("error");
                let message = data["error"]["message"].as_str().unwrap_or("unknown error");
                vec![Decoded::Failed(ProviderError::StreamInterrupted(format!(
                    "{kind}: {message}"
                )))]
            }
            other => {
                trace!(event = other, "Ignoring native stream event");
                Vec::new()
            }
        }
    }
}
