//! Chat surface collaborator: the message list the orchestrator renders into.
//!
//! The surface owns the list; the orchestrator only holds positions into it.

use serde::{Deserialize, Serialize};

use crate::message::Role;
use crate::response::{FileChangeProposal, PlanStep};
use crate::tool::ToolUsage;

/// What a displayed message represents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayKind {
    /// Regular text (user prompt or assistant answer)
    Text,
    /// Live reasoning output, hidden once the answer arrives
    Thinking,
    /// Placeholder while a tool batch executes
    RunningTools,
    /// Inline stream error; `retry_prompt` is resubmitted on retry
    Error { retry_prompt: Option<String> },
    /// Standalone informational notice (plan halted, changes applied, ...)
    Notice,
    /// One step of an active plan awaiting review
    PlanStep { index: usize, total: usize },
}

/// A message as the chat UI sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub role: Role,
    pub kind: DisplayKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_usages: Vec<ToolUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_changes: Vec<FileChangeProposal>,
    /// Still receiving deltas
    #[serde(default)]
    pub streaming: bool,
}

impl DisplayMessage {
    fn new(role: Role, kind: DisplayKind, content: impl Into<String>) -> Self {
        Self {
            role,
            kind,
            content: content.into(),
            thinking: String::new(),
            tool_usages: Vec::new(),
            file_changes: Vec::new(),
            streaming: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, DisplayKind::Text, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, DisplayKind::Text, content)
    }

    /// Empty assistant message that deltas are written into.
    pub fn streaming_placeholder() -> Self {
        let mut msg = Self::assistant("");
        msg.streaming = true;
        msg
    }

    pub fn running_tools(usages: Vec<ToolUsage>) -> Self {
        let names: Vec<_> = usages.iter().map(|u| u.tool_name.as_str()).collect();
        let mut msg = Self::new(
            Role::Assistant,
            DisplayKind::RunningTools,
            format!("Running tools: {}", names.join(", ")),
        );
        msg.tool_usages = usages;
        msg
    }

    pub fn error(message: impl Into<String>, retry_prompt: Option<String>) -> Self {
        Self::new(
            Role::Assistant,
            DisplayKind::Error { retry_prompt },
            message,
        )
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self::new(Role::System, DisplayKind::Notice, content)
    }

    pub fn plan_step(index: usize, total: usize, step: &PlanStep) -> Self {
        let mut msg = Self::new(
            Role::Assistant,
            DisplayKind::PlanStep { index, total },
            format!("Step {}/{}: {}", index + 1, total, step.description),
        );
        msg.file_changes = step.file_changes.clone();
        msg
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, DisplayKind::Error { .. })
    }
}

/// Operations the orchestrator needs from the chat rendering layer.
///
/// All calls are made from the session task; implementations need not be
/// thread-safe beyond `Send`.
pub trait ChatSurface: Send {
    /// Append a message and return its position.
    fn add_message(&mut self, message: DisplayMessage) -> usize;

    /// Replace the message at `position` in place.
    fn update_message(&mut self, position: usize, message: DisplayMessage);

    fn get_message_at(&self, position: usize) -> Option<DisplayMessage>;

    /// Hide any visible thinking indicator.
    fn hide_thinking_message(&mut self);
}

/// In-memory surface. Useful for tests and headless sessions.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    pub messages: Vec<DisplayMessage>,
    pub thinking_hidden: usize,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&DisplayMessage> {
        self.messages.last()
    }
}

impl ChatSurface for MessageLog {
    fn add_message(&mut self, message: DisplayMessage) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    fn update_message(&mut self, position: usize, message: DisplayMessage) {
        if let Some(slot) = self.messages.get_mut(position) {
            *slot = message;
        }
    }

    fn get_message_at(&self, position: usize) -> Option<DisplayMessage> {
        self.messages.get(position).cloned()
    }

    fn hide_thinking_message(&mut self) {
        self.thinking_hidden += 1;
    }
}
