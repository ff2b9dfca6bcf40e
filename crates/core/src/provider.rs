//! Provider client trait: the abstraction over model backends.
//!
//! A provider client turns a [`StreamRequest`] into a live event stream.
//! Implementations: the native messages backend and the OpenAI-compatible
//! chat completions backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::stream::{StreamHandle, StreamRequest};

/// A model entry from the registry, with the capability flags the
/// orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model id sent on the wire (e.g. "claude-sonnet-4", "gpt-4o")
    pub id: String,

    /// Name of the configured provider that serves this model
    pub provider: String,

    /// The model cannot use multi-turn context natively; history is windowed.
    #[serde(default)]
    pub single_round: bool,

    /// The model supports extended thinking / reasoning output.
    #[serde(default)]
    pub thinking: bool,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            single_round: false,
            thinking: false,
        }
    }

    pub fn single_round(mut self, single_round: bool) -> Self {
        self.single_round = single_round;
        self
    }

    pub fn thinking(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }
}

/// The core provider client trait.
///
/// `send_message_streaming` returns immediately; the request runs on its
/// own task and reports through the returned handle. Every request reaches
/// exactly one terminal event unless it is cancelled, in which case the
/// handle simply closes.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// A human-readable name for this client (e.g. "anthropic", "openrouter").
    fn name(&self) -> &str;

    fn send_message_streaming(&self, request: StreamRequest) -> StreamHandle;

    /// Cancel one in-flight request. Returns whether a live request was
    /// found; cancelling an unknown or already-cancelled id is a no-op.
    fn cancel_streaming(&self, request_id: &str) -> bool;

    /// Number of requests currently in flight.
    fn active_requests(&self) -> usize;

    /// Models the backend advertises.
    async fn fetch_models(&self) -> std::result::Result<Vec<String>, ProviderError>;
}
