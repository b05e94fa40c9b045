//! Git adapter for commits, stashes and worktrees.
//!
//! The engine only needs a handful of git operations, so we keep a small,
//! explicit wrapper around `git` subprocess calls rather than a library binding.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Record the working tree as a dangling stash commit without touching it.
    ///
    /// Returns `None` for a clean tree. The commit is made reachable under
    /// `refs/stash` with `message` so `git gc` keeps it.
    #[instrument(skip_all)]
    pub fn stash_snapshot(&self, message: &str) -> Result<Option<String>> {
        let sha = self.run_capture(&["stash", "create", message])?;
        let sha = sha.trim();
        if sha.is_empty() {
            debug!("clean tree, no stash commit");
            return Ok(None);
        }
        self.run_checked(&["stash", "store", "-m", message, sha])?;
        Ok(Some(sha.to_string()))
    }

    /// Apply a stash commit onto the working tree.
    pub fn stash_apply(&self, stash_ref: &str) -> Result<()> {
        self.run_checked(&["stash", "apply", stash_ref])?;
        Ok(())
    }

    /// Create (or reset) `branch` at `base` and check it out at `path`.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "add", "-B", branch, path, base])?;
        Ok(())
    }

    /// Force-remove the worktree at `path`.
    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "remove", "--force", path])?;
        Ok(())
    }

    /// Drop administrative data for worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Paths of all worktrees git currently tracks (including the main checkout).
    pub fn worktree_list(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

fn parse_worktree_list(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(|path| PathBuf::from(path.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_porcelain() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo/.taskloop/workspaces/w0-t-1\nHEAD def\nbranch refs/heads/taskloop/w0-t-1\n\n";
        assert_eq!(
            parse_worktree_list(out),
            vec![
                PathBuf::from("/repo"),
                PathBuf::from("/repo/.taskloop/workspaces/w0-t-1")
            ]
        );
    }

    #[test]
    fn stash_snapshot_of_clean_tree_is_none() {
        let repo = crate::test_support::TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert_eq!(git.stash_snapshot("clean").expect("stash"), None);
    }

    #[test]
    fn stash_snapshot_keeps_tree_and_records_commit() {
        let repo = crate::test_support::TestRepo::new().expect("repo");
        std::fs::write(repo.path().join("README.md"), "changed\n").expect("write");
        let git = Git::new(repo.path());

        let sha = git.stash_snapshot("snap").expect("stash").expect("sha");
        assert_eq!(sha.len(), 40);
        let contents = std::fs::read_to_string(repo.path().join("README.md")).expect("read");
        assert_eq!(contents, "changed\n");
    }
}
