//! `listFiles`: list entries under a project directory.

use async_trait::async_trait;
use pocketcode_core::error::ToolError;
use pocketcode_core::tool::Tool;
use serde_json::{Map, Value, json};

use crate::sandbox::Sandbox;
use crate::walk::walk;
use crate::{optional_bool, optional_str, optional_usize, permission_denied};

const DEFAULT_MAX_ENTRIES: usize = 500;

pub struct ListFilesTool {
    sandbox: Sandbox,
}

impl ListFilesTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "listFiles"
    }

    fn description(&self) -> &str {
        "List files in a project directory, skipping gitignored paths. Directories end with '/'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the project root (default '.')"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Include nested directories"
                },
                "maxResults": {
                    "type": "integer",
                    "description": "Maximum number of entries"
                }
            }
        })
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        let path = optional_str(&args, &["path", "filePath", "directory"]).unwrap_or(".");
        let recursive = optional_bool(&args, &["recursive"]).unwrap_or(false);
        let max = optional_usize(&args, &["maxResults", "max_results"])
            .unwrap_or(DEFAULT_MAX_ENTRIES)
            .max(1);

        let dir = self
            .sandbox
            .resolve(path)
            .map_err(|e| permission_denied(self.name(), e))?;
        if !dir.is_dir() {
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: format!("{path} is not a directory"),
            });
        }

        let depth = if recursive { None } else { Some(1) };
        let root = dir.clone();
        let walked = tokio::task::spawn_blocking(move || walk(&root, depth, max, |_| true))
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            })?;
        if walked.entries.is_empty() && !walked.errors.is_empty() {
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: walked.errors.join("; "),
            });
        }

        let mut files: Vec<String> = walked
            .entries
            .iter()
            .map(|entry| {
                let rel = self.sandbox.relative(&entry.path);
                if entry.is_dir { format!("{rel}/") } else { rel }
            })
            .collect();
        files.sort();

        let mut result = json!({
            "path": self.sandbox.relative(&dir),
            "files": files,
            "truncated": walked.truncated,
        });
        if !walked.errors.is_empty() {
            result["errors"] = json!(walked.errors);
        }
        Ok(result)
    }
}
