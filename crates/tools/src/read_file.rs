//! `readFile`: read a text file from the project, optionally a line range.

use async_trait::async_trait;
use pocketcode_core::error::ToolError;
use pocketcode_core::tool::Tool;
use serde_json::{Map, Value, json};

use crate::sandbox::Sandbox;
use crate::{optional_usize, permission_denied, required_str};

/// Files larger than this are refused; the model should ask for a range.
const MAX_READ_BYTES: u64 = 256 * 1024;

pub struct ReadFileTool {
    sandbox: Sandbox,
}

impl ReadFileTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "readFile"
    }

    fn description(&self) -> &str {
        "Read a text file from the project. Optionally limit to a 1-based inclusive line range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the project root"
                },
                "startLine": {
                    "type": "integer",
                    "description": "First line to return (1-based)"
                },
                "endLine": {
                    "type": "integer",
                    "description": "Last line to return (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        let path = required_str(&args, &["path", "filePath"])?;
        let resolved = self
            .sandbox
            .resolve(path)
            .map_err(|e| permission_denied(self.name(), e))?;

        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| failed(self.name(), format!("{path}: {e}")))?;
        if meta.is_dir() {
            return Err(failed(self.name(), format!("{path} is a directory")));
        }

        let start = optional_usize(&args, &["startLine", "start_line"]);
        let end = optional_usize(&args, &["endLine", "end_line"]);
        if start.is_none() && end.is_none() && meta.len() > MAX_READ_BYTES {
            return Err(failed(
                self.name(),
                format!(
                    "{path} is {} bytes; request a line range (limit {MAX_READ_BYTES})",
                    meta.len()
                ),
            ));
        }

        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| failed(self.name(), format!("{path}: {e}")))?;
        let content = String::from_utf8(bytes)
            .map_err(|_| failed(self.name(), format!("{path} is not valid UTF-8 text")))?;

        let total_lines = content.lines().count();
        let content = match (start, end) {
            (None, None) => content,
            (start, end) => {
                let first = start.unwrap_or(1).max(1);
                let last = end.unwrap_or(total_lines).min(total_lines);
                content
                    .lines()
                    .skip(first - 1)
                    .take(last.saturating_sub(first - 1))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        Ok(json!({
            "path": self.sandbox.relative(&resolved),
            "content": content,
            "totalLines": total_lines,
        }))
    }
}

fn failed(tool_name: &str, reason: String) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool_name.into(),
        reason,
    }
}
