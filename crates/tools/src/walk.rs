//! Project tree walking for `listFiles` and `searchFiles`.
//!
//! Honours `.gitignore`, `.ignore` and git excludes whether or not the
//! project is a git checkout, and never enters `.git`. Entries come back in
//! file-name order so a truncated walk is always the same prefix.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

pub(crate) struct Entry {
    pub path: PathBuf,
    pub is_dir: bool,
}

#[derive(Default)]
pub(crate) struct Walked {
    pub entries: Vec<Entry>,
    /// Unreadable directories and bad ignore files, as messages.
    pub errors: Vec<String>,
    pub truncated: bool,
}

/// Walk `root` (excluded from the result). `max_depth` of `Some(1)` yields
/// direct children only. Stops after `limit` entries accepted by `keep`.
pub(crate) fn walk(
    root: &Path,
    max_depth: Option<usize>,
    limit: usize,
    keep: impl Fn(&Entry) -> bool,
) -> Walked {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .require_git(false)
        .max_depth(max_depth)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|e| e.file_name() != ".git")
        .build();

    let mut walked = Walked::default();
    for result in walker {
        let entry = match result {
            Ok(entry) if entry.depth() == 0 => continue,
            Ok(entry) => Entry {
                is_dir: entry.file_type().is_some_and(|t| t.is_dir()),
                path: entry.into_path(),
            },
            Err(e) => {
                debug!(error = %e, "Walk error");
                walked.errors.push(e.to_string());
                continue;
            }
        };
        if !keep(&entry) {
            continue;
        }
        if walked.entries.len() >= limit {
            walked.truncated = true;
            break;
        }
        walked.entries.push(entry);
    }
    walked
}
