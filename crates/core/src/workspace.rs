//! File-apply collaborator: writes accepted changes to the project tree.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApplyError;
use crate::response::FileChangeProposal;

/// Result of applying one proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyOutcome {
    pub fn ok(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: None,
        }
    }

    pub fn failed(path: impl Into<String>, err: &ApplyError) -> Self {
        Self {
            path: path.into(),
            error: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Applies proposals to the project. One outcome per proposal, in order;
/// a failing item does not stop the rest.
#[async_trait]
pub trait FileApplier: Send + Sync {
    async fn apply(&self, changes: &[FileChangeProposal]) -> Vec<ApplyOutcome>;
}

/// Summary line for a batch of outcomes.
pub fn summarize(outcomes: &[ApplyOutcome]) -> String {
    let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_ok()).collect();
    if failed.is_empty() {
        return format!("Applied {} change(s)", outcomes.len());
    }
    let details: Vec<_> = failed
        .iter()
        .map(|o| format!("{}: {}", o.path, o.error.as_deref().unwrap_or("failed")))
        .collect();
    format!(
        "Applied {} of {} change(s); failed: {}",
        outcomes.len() - failed.len(),
        outcomes.len(),
        details.join("; ")
    )
}
