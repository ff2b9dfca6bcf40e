//! Provider router. Selects the backend for a request by the model's
//! provider name, and owns the model registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pocketcode_config::{AppConfig, ProviderKind};
use pocketcode_core::error::ProviderError;
use pocketcode_core::provider::{ModelInfo, ProviderClient};
use pocketcode_core::stream::{StreamHandle, StreamRequest, stream_channel};
use tracing::{debug, warn};

use crate::native::NativeClient;
use crate::openai_compat::{Dialect, OpenAiCompatClient};
use crate::transport::SseTransport;

/// Known models, in configuration order. The first is the default.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelInfo>,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn list(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn default_model(&self) -> Option<&ModelInfo> {
        self.models.first()
    }

    /// Resolve a model id, treating unknown ids as plain models on `fallback_provider`.
    pub fn resolve(&self, id: &str, fallback_provider: &str) -> ModelInfo {
        self.get(id)
            .cloned()
            .unwrap_or_else(|| ModelInfo::new(id, fallback_provider))
    }
}

/// Routes streaming requests to the backend named by `request.model.provider`.
#[derive(Default)]
pub struct ProviderRouter {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.clients.insert(name.into(), client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(name).cloned()
    }

    /// Registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ProviderClient for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn send_message_streaming(&self, request: StreamRequest) -> StreamHandle {
        if let Some(client) = self.clients.get(&request.model.provider) {
            return client.send_message_streaming(request);
        }

        warn!(provider = %request.model.provider, "No client for provider");
        let err = ProviderError::NotConfigured(request.model.provider.clone());
        let (sink, handle) = stream_channel(&request.request_id);
        tokio::spawn(async move { sink.fail(&err).await });
        handle
    }

    fn cancel_streaming(&self, request_id: &str) -> bool {
        // request ids are unique, at most one client knows the id
        self.clients
            .values()
            .any(|client| client.cancel_streaming(request_id))
    }

    fn active_requests(&self) -> usize {
        self.clients.values().map(|c| c.active_requests()).sum()
    }

    async fn fetch_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let mut models = Vec::new();
        let mut last_err = None;
        for name in self.list() {
            let Some(client) = self.clients.get(name) else {
                continue;
            };
            match client.fetch_models().await {
                Ok(ids) => models.extend(ids),
                Err(e) => {
                    debug!(provider = name, error = %e, "Model listing failed");
                    last_err = Some(e);
                }
            }
        }
        match (models.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(models),
        }
    }
}

/// Build the router for every provider the configuration uses.
pub fn build_from_config(config: &AppConfig) -> std::result::Result<ProviderRouter, ProviderError> {
    let transport = SseTransport::new(Duration::from_secs(
        config.transport.connect_timeout_secs,
    ))?;
    let mut router = ProviderRouter::new();

    for (name, provider) in config.active_providers() {
        let api_key = config.api_key_for(&name).unwrap_or_default();
        let base_url = provider.base_url();

        let client: Arc<dyn ProviderClient> = match provider.kind {
            ProviderKind::Native => Arc::new(
                NativeClient::new(&name, api_key, transport.clone())
                    .with_base_url(base_url)
                    .with_max_tokens(provider.max_tokens)
                    .with_thinking_budget(provider.thinking_budget),
            ),
            ProviderKind::OpenAi => Arc::new(
                OpenAiCompatClient::new(&name, base_url, api_key, transport.clone())
                    .with_max_tokens(provider.max_tokens),
            ),
            ProviderKind::Ollama => Arc::new(
                OpenAiCompatClient::new(&name, base_url, api_key, transport.clone())
                    .with_dialect(Dialect::OllamaChat),
            ),
        };
        debug!(provider = %name, kind = ?provider.kind, "Registered provider");
        router.register(name, client);
    }

    Ok(router)
}
