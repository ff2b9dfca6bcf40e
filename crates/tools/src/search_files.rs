//! `searchFiles`: find lines matching text or a regex across the project.

use std::path::PathBuf;

use async_trait::async_trait;
use pocketcode_core::error::ToolError;
use pocketcode_core::tool::Tool;
use regex_lite::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};
use tracing::trace;

use crate::sandbox::Sandbox;
use crate::walk::walk;
use crate::{optional_bool, optional_str, optional_usize, permission_denied, required_str};

const DEFAULT_MAX_RESULTS: usize = 50;
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const MAX_LINE_CHARS: usize = 200;

pub struct SearchFilesTool {
    sandbox: Sandbox,
}

impl SearchFilesTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    fn invalid(&self, reason: String) -> ToolError {
        ToolError::InvalidArguments(format!("{}: {reason}", self.name()))
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "searchFiles"
    }

    fn description(&self) -> &str {
        "Search project files for a text or regex and return matching lines."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Text or pattern to search for" },
                "path": { "type": "string", "description": "Directory to search (default '.')" },
                "regex": { "type": "boolean", "description": "Treat query as a regular expression" },
                "caseSensitive": { "type": "boolean", "description": "Match case (default false)" },
                "extension": { "type": "string", "description": "Only search files with this extension, e.g. 'rs'" },
                "maxResults": { "type": "integer", "description": "Maximum matches to return" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        let query = required_str(&args, &["query", "pattern", "text"])?;
        if query.is_empty() {
            return Err(self.invalid("empty query".into()));
        }
        let path = optional_str(&args, &["path", "directory"]).unwrap_or(".");
        let use_regex = optional_bool(&args, &["regex"]).unwrap_or(false);
        let case_sensitive = optional_bool(&args, &["caseSensitive", "case_sensitive"]).unwrap_or(false);
        let extension = optional_str(&args, &["extension", "ext"]).map(|e| e.trim_start_matches('.'));
        let max = optional_usize(&args, &["maxResults", "max_results"])
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .max(1);

        let pattern = if use_regex {
            query.to_string()
        } else {
            regex_lite::escape(query)
        };
        let matcher: Regex = RegexBuilder::new(&pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| self.invalid(format!("invalid regex: {e}")))?;

        let root = self
            .sandbox
            .resolve(path)
            .map_err(|e| permission_denied(self.name(), e))?;

        let mut matches = Vec::new();
        let mut files_searched = 0usize;
        let mut truncated = false;

        let files = collect_files(root, extension)
            .await
            .map_err(|reason| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason,
            })?;

        'files: for file in files {
            let Ok(meta) = tokio::fs::metadata(&file).await else {
                continue;
            };
            if meta.len() > MAX_FILE_BYTES {
                continue;
            }
            // binary or non-UTF-8 files are skipped
            let Ok(content) = tokio::fs::read_to_string(&file).await else {
                trace!(path = %file.display(), "Skipping unreadable file");
                continue;
            };
            files_searched += 1;

            for (i, line) in content.lines().enumerate() {
                if !matcher.is_match(line) {
                    continue;
                }
                if matches.len() >= max {
                    truncated = true;
                    break 'files;
                }
                matches.push(json!({
                    "path": self.sandbox.relative(&file),
                    "line": i + 1,
                    "text": line.trim().chars().take(MAX_LINE_CHARS).collect::<String>(),
                }));
            }
        }

        Ok(json!({
            "query": query,
            "matches": matches,
            "filesSearched": files_searched,
            "truncated": truncated,
        }))
    }
}

/// Files under `root` in path order, skipping gitignored paths.
async fn collect_files(root: PathBuf, extension: Option<&str>) -> Result<Vec<PathBuf>, String> {
    if root.is_file() {
        return Ok(vec![root]);
    }
    let extension = extension.map(str::to_owned);
    let walked = tokio::task::spawn_blocking(move || {
        walk(&root, None, usize::MAX, |entry| {
            !entry.is_dir
                && extension
                    .as_deref()
                    .is_none_or(|ext| entry.path.extension().is_some_and(|e| e == ext))
        })
    })
    .await
    .map_err(|e| e.to_string())?;
    for error in &walked.errors {
        trace!(%error, "Skipped part of the tree");
    }
    Ok(walked.entries.into_iter().map(|e| e.path).collect())
}
