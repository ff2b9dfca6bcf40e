//! Structured results recovered from a completed model response.

use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// What the orchestrator should do with a parsed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Plain answer, nothing to execute.
    #[default]
    Answer,
    /// Run tools, then continue the conversation with their results.
    ToolCalls,
    /// Offer (or apply) a flat list of file changes.
    FileChanges,
    /// Start a multi-step plan.
    Plan,
}

/// A fully parsed model response. Produced once per completed stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub action: ActionKind,
    pub explanation: String,
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_changes: Vec<FileChangeProposal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan_steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub is_valid: bool,
    /// Reasoning text streamed alongside the answer, if the backend marks it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
}

impl ParsedResponse {
    /// A response with no recoverable structure.
    pub fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            action: ActionKind::Answer,
            explanation: text.clone(),
            raw_response: text,
            is_valid: false,
            ..Default::default()
        }
    }

    pub fn has_actions(&self) -> bool {
        !self.tool_calls.is_empty() || !self.file_changes.is_empty() || !self.plan_steps.is_empty()
    }
}

/// Kind of change proposed for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Update,
    Delete,
    Rename,
    Patch,
}

impl FileOperation {
    /// Lenient mapping of the names models use for operations.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "create" | "add" | "new" | "create_file" => Some(Self::Create),
            "update" | "modify" | "edit" | "replace" | "write" | "update_file" => Some(Self::Update),
            "delete" | "remove" | "delete_file" => Some(Self::Delete),
            "rename" | "move" | "rename_file" => Some(Self::Rename),
            "patch" | "diff" | "apply_patch" => Some(Self::Patch),
            _ => None,
        }
    }
}

/// A single proposed change to the project tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeProposal {
    pub operation: FileOperation,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(default)]
    pub old_content: String,
    #[serde(default)]
    pub new_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl FileChangeProposal {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            operation: FileOperation::Create,
            path: path.into(),
            old_path: None,
            new_path: None,
            old_content: String::new(),
            new_content: content.into(),
            diff: None,
        }
    }

    pub fn update(
        path: impl Into<String>,
        old_content: impl Into<String>,
        new_content: impl Into<String>,
    ) -> Self {
        Self {
            operation: FileOperation::Update,
            path: path.into(),
            old_path: None,
            new_path: None,
            old_content: old_content.into(),
            new_content: new_content.into(),
            diff: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            operation: FileOperation::Delete,
            path: path.into(),
            old_path: None,
            new_path: None,
            old_content: String::new(),
            new_content: String::new(),
            diff: None,
        }
    }

    pub fn rename(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        let old_path = old_path.into();
        Self {
            operation: FileOperation::Rename,
            path: old_path.clone(),
            old_path: Some(old_path),
            new_path: Some(new_path.into()),
            old_content: String::new(),
            new_content: String::new(),
            diff: None,
        }
    }

    pub fn patch(path: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            operation: FileOperation::Patch,
            path: path.into(),
            old_path: None,
            new_path: None,
            old_content: String::new(),
            new_content: String::new(),
            diff: Some(diff.into()),
        }
    }

    /// Enforce the per-operation invariants. Returns `None` when the
    /// proposal cannot be made consistent (e.g. a rename without a target).
    pub fn normalized(mut self) -> Option<Self> {
        if self.path.trim().is_empty() && self.old_path.is_none() {
            return None;
        }
        match self.operation {
            FileOperation::Create => self.old_content.clear(),
            FileOperation::Delete => self.new_content.clear(),
            FileOperation::Rename => {
                if self.old_path.is_none() && !self.path.is_empty() {
                    self.old_path = Some(self.path.clone());
                }
                let old = self.old_path.as_deref()?;
                if self.new_path.as_deref().is_none_or(str::is_empty) {
                    return None;
                }
                if self.path.is_empty() {
                    self.path = old.to_string();
                }
            }
            FileOperation::Patch => {
                if self.diff.as_deref().is_none_or(str::is_empty) && self.new_content.is_empty() {
                    return None;
                }
            }
            FileOperation::Update => {}
        }
        Some(self)
    }
}

/// Status of one step in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Accepted,
    Discarded,
    Failed,
}

/// One step of a model-proposed plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_changes: Vec<FileChangeProposal>,
}

impl PlanStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: StepStatus::Pending,
            file_changes: Vec::new(),
        }
    }
}
