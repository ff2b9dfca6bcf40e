//! Filesystem file applier. Writes accepted proposals under the workspace root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pocketcode_core::error::ApplyError;
use pocketcode_core::response::{FileChangeProposal, FileOperation};
use pocketcode_core::workspace::{ApplyOutcome, FileApplier};
use tracing::{debug, warn};

use crate::patch::apply_unified_diff;
use crate::sandbox::Sandbox;

/// Applies proposals to the project directory, one at a time, in order.
#[derive(Debug, Clone)]
pub struct ProjectFileApplier {
    sandbox: Sandbox,
}

impl ProjectFileApplier {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ApplyError> {
        self.sandbox
            .resolve(path)
            .map_err(|_| ApplyError::OutsideWorkspace(PathBuf::from(path)))
    }

    async fn apply_one(&self, change: FileChangeProposal) -> Result<(), ApplyError> {
        match change.operation {
            FileOperation::Create => {
                let path = self.resolve(&change.path)?;
                if path.exists() {
                    return Err(ApplyError::AlreadyExists(path));
                }
                write_file(&path, &change.new_content).await
            }
            FileOperation::Update => {
                let path = self.resolve(&change.path)?;
                let current = read_file(&path).await?;
                let updated = replace_content(&current, &change.old_content, &change.new_content)
                    .ok_or_else(|| ApplyError::PatchRejected {
                        path: path.clone(),
                        reason: "old content does not match the file".into(),
                    })?;
                write_file(&path, &updated).await
            }
            FileOperation::Delete => {
                let path = self.resolve(&change.path)?;
                if !path.is_file() {
                    return Err(ApplyError::NotFound(path));
                }
                tokio::fs::remove_file(&path).await.map_err(|e| io(&path, e))
            }
            FileOperation::Rename => {
                // normalized() guarantees both paths
                let from = self.resolve(change.old_path.as_deref().unwrap_or(&change.path))?;
                let to = self.resolve(change.new_path.as_deref().unwrap_or_default())?;
                if !from.exists() {
                    return Err(ApplyError::NotFound(from));
                }
                if to.exists() {
                    return Err(ApplyError::AlreadyExists(to));
                }
                ensure_parent(&to).await?;
                tokio::fs::rename(&from, &to).await.map_err(|e| io(&from, e))
            }
            FileOperation::Patch => {
                let path = self.resolve(&change.path)?;
                match change.diff.as_deref().filter(|d| !d.trim().is_empty()) {
                    Some(diff) => {
                        let current = if path.exists() {
                            read_file(&path).await?
                        } else {
                            String::new()
                        };
                        let patched = apply_unified_diff(&current, diff).map_err(|reason| {
                            ApplyError::PatchRejected {
                                path: path.clone(),
                                reason,
                            }
                        })?;
                        write_file(&path, &patched).await
                    }
                    None => write_file(&path, &change.new_content).await,
                }
            }
        }
    }
}

#[async_trait]
impl FileApplier for ProjectFileApplier {
    async fn apply(&self, changes: &[FileChangeProposal]) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            let label = change.path.clone();
            let result = match change.clone().normalized() {
                Some(change) => self.apply_one(change).await,
                None => Err(ApplyError::InvalidChange {
                    path: label.clone(),
                    reason: format!("incomplete {:?} proposal", change.operation),
                }),
            };
            match result {
                Ok(()) => {
                    debug!(path = %label, operation = ?change.operation, "Applied change");
                    outcomes.push(ApplyOutcome::ok(label));
                }
                Err(e) => {
                    warn!(path = %label, error = %e, "Failed to apply change");
                    outcomes.push(ApplyOutcome::failed(label, &e));
                }
            }
        }
        outcomes
    }
}

/// Whole-file replacement when `old` is empty or equals the file; otherwise
/// `old` is a snippet replaced at its first occurrence.
fn replace_content(current: &str, old: &str, new: &str) -> Option<String> {
    if old.is_empty() || old == current {
        return Some(new.to_string());
    }
    current
        .contains(old)
        .then(|| current.replacen(old, new, 1))
}

fn io(path: &Path, e: std::io::Error) -> ApplyError {
    ApplyError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

async fn read_file(path: &Path) -> Result<String, ApplyError> {
    if !path.is_file() {
        return Err(ApplyError::NotFound(path.to_path_buf()));
    }
    tokio::fs::read_to_string(path).await.map_err(|e| io(path, e))
}

async fn ensure_parent(path: &Path) -> Result<(), ApplyError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io(parent, e))?;
    }
    Ok(())
}

async fn write_file(path: &Path, content: &str) -> Result<(), ApplyError> {
    ensure_parent(path).await?;
    tokio::fs::write(path, content).await.map_err(|e| io(path, e))
}
