//! Built-in project tools for PocketCode.
//!
//! Tools let the model inspect the open project: list directories, read
//! files and search text. Every path is confined to the workspace root by
//! the [`Sandbox`]. The [`ProjectFileApplier`] writes accepted file changes
//! under the same root.

pub mod applier;
pub mod list_files;
pub mod patch;
pub mod read_file;
pub mod sandbox;
pub mod search_files;
mod walk;

use std::path::Path;
use std::sync::Arc;

use pocketcode_core::error::ToolError;
use pocketcode_core::tool::ToolRegistry;
use serde_json::{Map, Value};

pub use applier::ProjectFileApplier;
pub use list_files::ListFilesTool;
pub use patch::apply_unified_diff;
pub use read_file::ReadFileTool;
pub use sandbox::{PathValidationError, Sandbox};
pub use search_files::SearchFilesTool;

/// Create a registry with every built-in tool rooted at `root`.
pub fn default_registry(root: impl AsRef<Path>) -> ToolRegistry {
    let sandbox = Sandbox::new(root);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ListFilesTool::new(sandbox.clone())));
    registry.register(Arc::new(ReadFileTool::new(sandbox.clone())));
    registry.register(Arc::new(SearchFilesTool::new(sandbox)));
    registry
}

// --- argument helpers (models vary in key naming) ---

pub(crate) fn optional_str<'a>(args: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| args.get(*k).and_then(Value::as_str))
}

pub(crate) fn required_str<'a>(
    args: &'a Map<String, Value>,
    keys: &[&str],
) -> Result<&'a str, ToolError> {
    optional_str(args, keys)
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{}' argument", keys[0])))
}

pub(crate) fn optional_bool(args: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| match args.get(*k)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

pub(crate) fn optional_usize(args: &Map<String, Value>, keys: &[&str]) -> Option<usize> {
    keys.iter().find_map(|k| match args.get(*k)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub(crate) fn permission_denied(tool_name: &str, err: PathValidationError) -> ToolError {
    ToolError::PermissionDenied {
        tool_name: tool_name.into(),
        reason: err.to_string(),
    }
}
