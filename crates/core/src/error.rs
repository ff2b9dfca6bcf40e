//! Error types for the PocketCode domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`ErrorClass`] maps them
//! onto the user-facing taxonomy the orchestrator reports against.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for PocketCode operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- File apply errors ---
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    // --- Plan errors ---
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used when deciding how a failure surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport could not connect or read. Retryable by resubmitting.
    NetworkFailure,
    /// No structure recovered from model output. Treated as plain text.
    MalformedResponse,
    /// A single tool failed. Recorded per tool, never fatal.
    ToolFailure,
    /// The user discarded a plan step.
    PlanHalt,
}

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

impl ProviderError {
    /// Stable machine-readable code carried by `StreamEvent::Error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ApiError { .. } => "api_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthenticationFailed(_) => "auth_failed",
            Self::ModelNotFound(_) => "model_not_found",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::NotConfigured(_) => "not_configured",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Whether resubmitting the same prompt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout(_)
                | Self::StreamInterrupted(_)
                | Self::RateLimited { .. }
        ) || matches!(self, Self::ApiError { status_code, .. } if *status_code >= 500)
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::NetworkFailure
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool panicked: {0}")]
    Panicked(String),
}

impl ToolError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::ToolFailure
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    #[error("Path escapes the workspace: {0}")]
    OutsideWorkspace(PathBuf),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("File already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Patch does not apply to {path}: {reason}")]
    PatchRejected { path: PathBuf, reason: String },

    #[error("Invalid change for {path}: {reason}")]
    InvalidChange { path: String, reason: String },

    #[error("I/O error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("No plan is active")]
    NoActivePlan,

    #[error("Plan step {index} is not awaiting a decision (state: {state})")]
    NotAwaitingDecision { index: usize, state: String },

    #[error("Plan cannot {action} in state {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error("Plan halted at step {index}")]
    Halted { index: usize },
}

impl PlanError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::PlanHalt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::PermissionDenied {
            tool_name: "readFile".into(),
            reason: "path escapes workspace".into(),
        });
        assert!(err.to_string().contains("readFile"));
        assert!(err.to_string().contains("workspace"));
    }

    #[test]
    fn provider_error_codes_and_retry() {
        assert_eq!(ProviderError::Network("refused".into()).code(), "network");
        assert!(ProviderError::Network("refused".into()).is_retryable());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_retryable());
        assert!(
            ProviderError::ApiError {
                status_code: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::ApiError {
                status_code: 400,
                message: "bad request".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn error_classes() {
        assert_eq!(
            ProviderError::Timeout("x".into()).class(),
            ErrorClass::NetworkFailure
        );
        assert_eq!(
            ToolError::NotFound("x".into()).class(),
            ErrorClass::ToolFailure
        );
        assert_eq!(PlanError::Halted { index: 1 }.class(), ErrorClass::PlanHalt);
    }
}
