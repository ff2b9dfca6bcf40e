//! Workspace sandbox. Confines tool and applier paths to the project root.
//!
//! Paths from the model are relative to the root (absolute paths are
//! accepted only when they already point inside it). Resolution is
//! lexical first, then the deepest existing ancestor is canonicalized so a
//! symlink cannot lead out of the tree.

use std::path::{Component, Path, PathBuf};

/// Error returned when a path cannot be confined to the workspace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the workspace")]
    OutsideWorkspace { path: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// The project root every tool operates under.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create a sandbox. The root is canonicalized when it exists.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` to an absolute path inside the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathValidationError> {
        let trimmed = path.trim();
        let raw = Path::new(if trimmed.is_empty() { "." } else { trimmed });

        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.root.join(raw)
        };

        let lexical = normalize(&joined).ok_or_else(|| PathValidationError::PathTraversal {
            path: path.into(),
        })?;
        let resolved = resolve_existing(&lexical).map_err(|reason| {
            PathValidationError::CanonicalizeFailed {
                path: path.into(),
                reason,
            }
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(PathValidationError::OutsideWorkspace { path: path.into() });
        }
        Ok(resolved)
    }

    /// Path relative to the root, with `/` separators, for tool output.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let s = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if s.is_empty() { ".".into() } else { s }
    }
}

/// Lexically collapse `.` and `..`. `None` when `..` climbs past the root
/// of the filesystem.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
fn resolve_existing(path: &Path) -> Result<PathBuf, String> {
    let mut existing = path;
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }

    let mut resolved = existing.canonicalize().map_err(|e| e.to_string())?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}
