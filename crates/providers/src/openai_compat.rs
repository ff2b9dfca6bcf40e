//! OpenAI-compatible backend.
//!
//! Works with OpenAI, OpenRouter, vLLM, LM Studio and any endpoint exposing
//! `/chat/completions` over SSE. The same client speaks Ollama's native
//! `/api/chat` NDJSON stream when built with [`Dialect::OllamaChat`].

use std::sync::Arc;

use async_trait::async_trait;
use pocketcode_core::error::ProviderError;
use pocketcode_core::message::{Message, Role};
use pocketcode_core::provider::ProviderClient;
use pocketcode_core::stream::{StreamHandle, StreamRequest, Usage};
use pocketcode_core::tool::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::native::model_ids;
use crate::streaming::{ActiveStreams, Decoded, EventDecoder, spawn_stream};
use crate::transport::{Framing, HttpRequest, SseTransport, status_error};

/// Which wire protocol the endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `/chat/completions`, SSE framed.
    ChatCompletions,
    /// Ollama `/api/chat`, newline-delimited JSON.
    OllamaChat,
}

/// An OpenAI-compatible streaming client.
pub struct OpenAiCompatClient {
    name: String,
    base_url: String,
    api_key: String,
    dialect: Dialect,
    max_tokens: Option<u32>,
    transport: SseTransport,
    active: Arc<ActiveStreams>,
}

impl OpenAiCompatClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        transport: SseTransport,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            dialect: Dialect::ChatCompletions,
            max_tokens: None,
            transport,
            active: Arc::new(ActiveStreams::default()),
        }
    }

    /// Ollama's native chat endpoint. No key required.
    pub fn ollama(base_url: impl Into<String>, transport: SseTransport) -> Self {
        Self::new("ollama", base_url, "", transport).with_dialect(Dialect::OllamaChat)
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn build_request(&self, request: &StreamRequest) -> (HttpRequest, Framing) {
        let messages = to_api_messages(request);
        match self.dialect {
            Dialect::ChatCompletions => {
                let mut body = json!({
                    "model": request.model.id,
                    "messages": messages,
                    "stream": true,
                    "stream_options": { "include_usage": true },
                });
                if let Some(max) = self.max_tokens {
                    body["max_tokens"] = json!(max);
                }
                if !request.tools.is_empty() {
                    body["tools"] = json!(to_api_tools(&request.tools));
                }
                let mut http =
                    HttpRequest::new(format!("{}/chat/completions", self.base_url), body);
                if !self.api_key.is_empty() {
                    http = http.header("Authorization", format!("Bearer {}", self.api_key));
                }
                (http, Framing::Sse)
            }
            Dialect::OllamaChat => {
                let mut body = json!({
                    "model": request.model.id,
                    "messages": messages,
                    "stream": true,
                });
                if request.thinking {
                    body["think"] = json!(true);
                }
                (
                    HttpRequest::new(format!("{}/api/chat", self.base_url), body),
                    Framing::NdJson,
                )
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

fn to_api_messages(request: &StreamRequest) -> Vec<ApiMessage> {
    let system = request.system_prompt.iter().map(|s| ApiMessage {
        role: "system",
        content: s.clone(),
    });
    let history = request.history.iter().map(|m: &Message| ApiMessage {
        role: m.role.as_str(),
        content: m.content.clone(),
    });
    let user = std::iter::once(ApiMessage {
        role: Role::User.as_str(),
        content: request.user_message.clone(),
    });
    system.chain(history).chain(user).collect()
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition<'a> {
    r#type: &'static str,
    function: ApiToolFunction<'a>,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition<'_>> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function",
            function: ApiToolFunction {
                name: &t.name,
                description: &t.description,
                parameters: &t.parameters,
            },
        })
        .collect()
}

#[async_trait]
impl ProviderClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_message_streaming(&self, request: StreamRequest) -> StreamHandle {
        debug!(
            provider = %self.name,
            model = %request.model.id,
            request_id = %request.request_id,
            dialect = ?self.dialect,
            "Sending streaming request"
        );
        let (http, framing) = self.build_request(&request);
        match self.dialect {
            Dialect::ChatCompletions => spawn_stream(
                &self.transport,
                &self.active,
                &request.request_id,
                http,
                framing,
                ChatDecoder,
            ),
            Dialect::OllamaChat => spawn_stream(
                &self.transport,
                &self.active,
                &request.request_id,
                http,
                framing,
                OllamaDecoder,
            ),
        }
    }

    fn cancel_streaming(&self, request_id: &str) -> bool {
        self.active.cancel(request_id)
    }

    fn active_requests(&self) -> usize {
        self.active.len()
    }

    async fn fetch_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let (path, list_key, id_key) = match self.dialect {
            Dialect::ChatCompletions => ("/models", "data", "id"),
            Dialect::OllamaChat => ("/api/tags", "models", "name"),
        };

        let mut builder = self
            .transport
            .client()
            .get(format!("{}{}", self.base_url, path));
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder
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
        Ok(model_ids(&body[list_key], id_key))
    }
}

// --- Streaming chunk types ---

/// A single SSE `data: {...}` chunk.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn in_stream_error(data: &Value) -> Option<Decoded> {
    let err = data.get("error")?;
    let message = err["message"]
        .as_str()
        .or_else(|| err.as_str())
        .unwrap_or("unknown error");
    Some(Decoded::Failed(ProviderError::StreamInterrupted(
        message.to_string(),
    )))
}

/// `/chat/completions` chunks. The stream ends on `[DONE]`.
struct ChatDecoder;

impl EventDecoder for ChatDecoder {
    fn decode(&mut self, _event: Option<&str>, data: &Value) -> Vec<Decoded> {
        if let Some(failed) = in_stream_error(data) {
            return vec![failed];
        }

        let chunk: StreamResponse = match serde_json::from_value(data.clone()) {
            Ok(c) => c,
            Err(e) => {
                trace!(error = %e, "Skipping unrecognized chunk");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(thinking) = delta.reasoning_content.filter(|t| !t.is_empty()) {
                out.push(Decoded::Thinking(thinking));
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                out.push(Decoded::Text(text));
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let Some(function) = tc.function else { continue };
                if let Some(name) = function.name {
                    out.push(Decoded::ToolStart {
                        index: tc.index,
                        name,
                    });
                }
                if let Some(fragment) = function.arguments.filter(|a| !a.is_empty()) {
                    out.push(Decoded::ToolArgs {
                        index: tc.index,
                        fragment,
                    });
                }
            }
        }
        if let Some(usage) = chunk.usage {
            out.push(Decoded::Usage(Usage {
                input_tokens: Usage::count(usage.prompt_tokens),
                output_tokens: Usage::count(usage.completion_tokens),
            }));
        }
        out
    }
}

/// Ollama `/api/chat` records. The record with `done: true` ends the stream.
struct OllamaDecoder;

impl EventDecoder for OllamaDecoder {
    fn decode(&mut self, _event: Option<&str>, data: &Value) -> Vec<Decoded> {
        if let Some(failed) = in_stream_error(data) {
            return vec![failed];
        }

        let mut out = Vec::new();
        let message = &data["message"];
        if let Some(thinking) = message["thinking"].as_str().filter(|t| !t.is_empty()) {
            out.push(Decoded::Thinking(thinking.to_string()));
        }
        if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
            out.push(Decoded::Text(text.to_string()));
        }
        if let Some(calls) = message["tool_calls"].as_array() {
            for (i, call) in calls.iter().enumerate() {
                let index = i as u32;
                let name = call["function"]["name"].as_str().unwrap_or("").to_string();
                out.push(Decoded::ToolStart { index, name });
                let args = &call["function"]["arguments"];
                if !args.is_null() {
                    out.push(Decoded::ToolArgs {
                        index,
                        fragment: args.to_string(),
                    });
                }
            }
        }

        if data["done"].as_bool() == Some(true) {
            out.push(Decoded::Usage(Usage {
                input_tokens: Usage::count(data["prompt_eval_count"].as_u64().unwrap_or(0)),
                output_tokens: Usage::count(data["eval_count"].as_u64().unwrap_or(0)),
            }));
            out.push(Decoded::Finished);
        }
        out
    }
}
