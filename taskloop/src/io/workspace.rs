//! Per-worker git worktrees.
//!
//! Every attempt in worker mode runs in its own checkout named
//! `w<index>-<task>` under the workspace root, on a branch of the same name
//! under the configured prefix. The branch outlives the checkout so committed
//! work stays reachable after removal.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;

const MAX_NAME_LEN: usize = 48;

static MANAGED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^w\d+-[A-Za-z0-9._-]+$").expect("workspace name pattern is valid")
});

/// Workspace failures. Callers treat these as fatal to the attempt only.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace {}: {diagnostic}", path.display())]
    Create { path: PathBuf, diagnostic: String },

    #[error("failed to remove workspace {}: {diagnostic}", path.display())]
    Remove { path: PathBuf, diagnostic: String },
}

/// A checkout owned by one worker for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: Git,
    root: PathBuf,
    branch_prefix: String,
}

impl WorkspaceManager {
    /// `repo_root` is the main checkout; workspaces live under `root`.
    pub fn new(
        repo_root: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            git: Git::new(repo_root),
            root: root.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check out a fresh branch at the main checkout's HEAD for `task_id`.
    ///
    /// A leftover directory or registration at the target path is cleaned up
    /// once before giving up.
    #[instrument(skip_all, fields(task_id, worker_index))]
    pub fn create(&self, task_id: &str, worker_index: usize) -> Result<Workspace, WorkspaceError> {
        let name = workspace_name(worker_index, task_id);
        let path = self.root.join(&name);
        let branch = format!("{}/{}", self.branch_prefix, name);
        let create_err = |diagnostic: String| WorkspaceError::Create {
            path: path.clone(),
            diagnostic,
        };

        fs::create_dir_all(&self.root).map_err(|err| create_err(err.to_string()))?;
        let base = self
            .git
            .head_sha()
            .map_err(|err| create_err(format!("{err:#}")))?;

        if let Err(first) = self.git.worktree_add(&path, &branch, &base) {
            warn!(err = %format!("{first:#}"), "worktree add failed, cleaning up and retrying");
            self.cleanup_collision(&path);
            self.git
                .worktree_add(&path, &branch, &base)
                .map_err(|err| create_err(format!("{err:#}")))?;
        }
        info!(path = %path.display(), branch, "workspace created");
        Ok(Workspace { path, branch })
    }

    /// Remove the checkout at `path`. A missing path is a no-op; a directory
    /// git does not track as a worktree is deleted directly.
    #[instrument(skip_all)]
    pub fn remove(&self, path: &Path) -> Result<(), WorkspaceError> {
        if !path.exists() {
            debug!(path = %path.display(), "workspace already gone");
            return Ok(());
        }
        let remove_err = |diagnostic: String| WorkspaceError::Remove {
            path: path.to_path_buf(),
            diagnostic,
        };
        let live = self
            .live_worktrees()
            .map_err(|err| remove_err(format!("{err:#}")))?;
        if live.contains(&canonical(path)) {
            self.git
                .worktree_remove(path)
                .map_err(|err| remove_err(format!("{err:#}")))?;
        } else {
            fs::remove_dir_all(path).map_err(|err| remove_err(err.to_string()))?;
        }
        debug!(path = %path.display(), "workspace removed");
        Ok(())
    }

    /// Managed workspace directories, sorted. Foreign entries are ignored.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read workspace root {}", self.root.display()));
            }
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.context("read workspace entry")?;
            let managed = entry.file_name().to_str().is_some_and(|n| MANAGED_NAME.is_match(n));
            if managed && entry.file_type().context("stat workspace entry")?.is_dir() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Delete managed directories that git no longer tracks as worktrees.
    #[instrument(skip_all)]
    pub fn reclaim_stale(&self) -> Result<usize> {
        self.git.worktree_prune().context("prune worktrees")?;
        let live = self.live_worktrees()?;
        let mut reclaimed = 0;
        for path in self.list()? {
            if live.contains(&canonical(&path)) {
                continue;
            }
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove stale workspace {}", path.display()))?;
            info!(path = %path.display(), "reclaimed stale workspace");
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    fn live_worktrees(&self) -> Result<HashSet<PathBuf>> {
        Ok(self
            .git
            .worktree_list()?
            .iter()
            .map(|p| canonical(p))
            .collect())
    }

    fn cleanup_collision(&self, path: &Path) {
        if let Err(err) = self.git.worktree_remove(path) {
            debug!(err = %format!("{err:#}"), "worktree remove during cleanup failed");
        }
        if path.exists()
            && let Err(err) = fs::remove_dir_all(path)
        {
            debug!(err = %err, "directory removal during cleanup failed");
        }
        if let Err(err) = self.git.worktree_prune() {
            debug!(err = %format!("{err:#}"), "worktree prune during cleanup failed");
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// `w<index>-<sanitized id>`.
pub fn workspace_name(worker_index: usize, task_id: &str) -> String {
    format!("w{worker_index}-{}", sanitize_task_id(task_id))
}

/// Reduce a task id to a safe path and branch component.
pub fn sanitize_task_id(task_id: &str) -> String {
    let mut out = String::with_capacity(task_id.len());
    let mut in_run = false;
    for c in task_id.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    let trimmed: String = out
        .trim_matches(|c| c == '-' || c == '.')
        .chars()
        .take(MAX_NAME_LEN)
        .collect();
    let trimmed = trimmed.trim_end_matches(['-', '.']);
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}
