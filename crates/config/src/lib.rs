//! Configuration loading, validation, and management for PocketCode.
//!
//! Loads configuration from `~/.pocketcode/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pocketcode_core::{AgentMode, ModelInfo};

/// The root configuration structure.
///
/// Maps directly to `~/.pocketcode/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key used by any provider that doesn't set its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider used for models that don't name one
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Model selected when a session starts
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Provider connection settings, keyed by name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Model registry entries
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// HTTP transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Project workspace settings
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("providers", &self.providers)
            .field("models", &self.models)
            .field("agent", &self.agent)
            .field("transport", &self.transport)
            .field("workspace", &self.workspace)
            .finish()
    }
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Anthropic-style messages API with typed SSE events
    Native,
    /// OpenAI-compatible chat completions
    #[serde(alias = "openai_compat")]
    OpenAi,
    /// Ollama's native chat API (newline-delimited JSON)
    Ollama,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL; each kind has a default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Token budget for extended thinking, when a model supports it
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: u32,
}

fn default_max_tokens() -> u32 {
    8192
}
fn default_thinking_budget() -> u32 {
    4096
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            api_key: None,
            api_url: None,
            max_tokens: default_max_tokens(),
            thinking_budget: default_thinking_budget(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Configured URL, or the kind's default.
    pub fn base_url(&self) -> String {
        self.api_url.clone().unwrap_or_else(|| match self.kind {
            ProviderKind::Native => "https://api.anthropic.com/v1".into(),
            ProviderKind::OpenAi => "https://api.openai.com/v1".into(),
            ProviderKind::Ollama => "http://localhost:11434".into(),
        })
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("max_tokens", &self.max_tokens)
            .field("thinking_budget", &self.thinking_budget)
            .finish()
    }
}

/// Providers known without any configuration.
fn builtin_provider(name: &str) -> Option<ProviderConfig> {
    match name {
        "anthropic" => Some(ProviderConfig::new(ProviderKind::Native)),
        "openai" => Some(ProviderConfig::new(ProviderKind::OpenAi)),
        "openrouter" => Some(
            ProviderConfig::new(ProviderKind::OpenAi).with_url("https://openrouter.ai/api/v1"),
        ),
        "ollama" => Some(ProviderConfig::new(ProviderKind::Ollama)),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,

    /// Provider name; falls back to `default_provider`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default)]
    pub single_round: bool,

    #[serde(default)]
    pub thinking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub mode: AgentMode,

    /// Cap on chained tool continuations per user prompt
    #[serde(default = "default_max_continuations")]
    pub max_continuations: u32,

    /// Messages kept for single-round models
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,

    /// Replaces the built-in system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_continuations() -> u32 {
    10
}
fn default_history_window() -> usize {
    12
}
fn default_max_parallel_tools() -> usize {
    4
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            mode: AgentMode::default(),
            max_continuations: default_max_continuations(),
            history_window: default_history_window(),
            max_parallel_tools: default_max_parallel_tools(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect timeout; reads are unbounded
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Project root that tools and the file applier are confined to
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.pocketcode/config.toml).
    ///
    /// Environment overrides:
    /// - `POCKETCODE_API_KEY`
    /// - `POCKETCODE_PROVIDER`
    /// - `POCKETCODE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("POCKETCODE_API_KEY")
                .or_else(|| lookup("ANTHROPIC_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(provider) = lookup("POCKETCODE_PROVIDER") {
            self.default_provider = provider;
        }
        if let Some(model) = lookup("POCKETCODE_MODEL") {
            self.default_model = model;
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs_home().join(".pocketcode")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.history_window == 0 {
            return Err(ConfigError::ValidationError(
                "agent.history_window must be at least 1".into(),
            ));
        }
        if self.agent.max_parallel_tools == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_parallel_tools must be at least 1".into(),
            ));
        }
        if self.transport.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "transport.connect_timeout_secs must be at least 1".into(),
            ));
        }
        for model in &self.models {
            let provider = model.provider.as_deref().unwrap_or(&self.default_provider);
            if self.provider(provider).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "model '{}' references unknown provider '{}'",
                    model.id, provider
                )));
            }
        }
        Ok(())
    }

    /// Look up a provider by name, falling back to the built-in presets.
    pub fn provider(&self, name: &str) -> Option<ProviderConfig> {
        self.providers
            .get(name)
            .cloned()
            .or_else(|| builtin_provider(name))
    }

    /// API key for a provider: its own key, then the global one.
    pub fn api_key_for(&self, name: &str) -> Option<String> {
        self.providers
            .get(name)
            .and_then(|p| p.api_key.clone())
            .or_else(|| self.api_key.clone())
    }

    /// Every provider a model refers to, plus the default provider.
    pub fn active_providers(&self) -> BTreeMap<String, ProviderConfig> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.push(self.default_provider.clone());
        names.extend(self.model_infos().into_iter().map(|m| m.provider));

        names
            .into_iter()
            .filter_map(|name| self.provider(&name).map(|p| (name, p)))
            .collect()
    }

    /// The model registry: configured models, plus the default model when
    /// it is not listed.
    pub fn model_infos(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = self
            .models
            .iter()
            .map(|m| {
                ModelInfo::new(
                    m.id.clone(),
                    m.provider.clone().unwrap_or_else(|| self.default_provider.clone()),
                )
                .single_round(m.single_round)
                .thinking(m.thinking)
            })
            .collect();
        if !infos.iter().any(|m| m.id == self.default_model) {
            infos.push(ModelInfo::new(
                self.default_model.clone(),
                self.default_provider.clone(),
            ));
        }
        infos
    }

    /// Generate a default config TOML string (for the `config --init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            providers: BTreeMap::new(),
            models: Vec::new(),
            agent: AgentSettings::default(),
            transport: TransportConfig::default(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.agent.max_continuations, 10);
        assert_eq!(config.agent.history_window, 12);
        assert_eq!(config.transport.connect_timeout_secs, 30);
        assert_eq!(config.agent.mode, AgentMode::Copilot);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_model, config.default_model);
        assert_eq!(parsed.agent.history_window, config.agent.history_window);
    }

    #[test]
    fn zero_history_window_rejected() {
        let mut config = AppConfig::default();
        config.agent.history_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.default_provider, "anthropic");
    }

    #[test]
    fn parses_providers_and_models() {
        let toml_str = r#"
default_provider = "local"
default_model = "qwen2.5-coder"

[providers.local]
kind = "openai"
api_url = "http://127.0.0.1:8080/v1"

[providers.claude]
kind = "native"
api_key = "sk-ant-secret"

[[models]]
id = "qwen2.5-coder"
single_round = true

[[models]]
id = "claude-sonnet-4"
provider = "claude"
thinking = true

[agent]
mode = "agent"
max_parallel_tools = 2
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        let models = config.model_infos();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].provider, "local");
        assert!(models[0].single_round);
        assert!(models[1].thinking);
        assert_eq!(config.agent.mode, AgentMode::Agent);
        assert_eq!(
            config.provider("local").unwrap().base_url(),
            "http://127.0.0.1:8080/v1"
        );
        assert_eq!(config.api_key_for("claude").as_deref(), Some("sk-ant-secret"));

        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-ant-secret"));
    }

    #[test]
    fn unknown_provider_kind_fails_to_parse() {
        let toml_str = r#"
[providers.x]
kind = "carrier-pigeon"
"#;
        assert!(toml::from_str::<AppConfig>(toml_str).is_err());
    }

    #[test]
    fn model_with_unknown_provider_rejected() {
        let mut config = AppConfig::default();
        config.models.push(ModelConfig {
            id: "m".into(),
            provider: Some("nowhere".into()),
            single_round: false,
            thinking: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("POCKETCODE_API_KEY", "from-env"),
            ("POCKETCODE_MODEL", "gpt-4o"),
            ("POCKETCODE_PROVIDER", "openai"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("from-env"));
        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.default_provider, "openai");
        assert!(config.active_providers().contains_key("openai"));
    }

    #[test]
    fn default_model_is_registered() {
        let config = AppConfig::default();
        let models = config.model_infos();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, config.default_model);
        assert_eq!(models[0].provider, "anthropic");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("anthropic"));
        assert!(toml_str.contains("history_window"));
    }
}
