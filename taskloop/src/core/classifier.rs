//! Deterministic classification of attempt output and changed paths.

use std::path::{Component, Path};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::core::types::FailureCause;

/// Directory (relative to the checkout) holding engine bookkeeping.
pub const STATE_DIR: &str = ".taskloop";

const DISK_MARKERS: &[&str] = &[
    "no space left on device",
    "enospc",
    "disk quota exceeded",
    "edquot",
];
const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "eacces",
    "operation not permitted",
    "eperm",
    "read-only file system",
];
const MISSING_COMMAND_MARKERS: &[&str] = &[
    "command not found",
    "not recognized as an internal or external command",
    "no such file or directory (os error 2)",
    "executable file not found",
];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout expired", "deadline exceeded"];

/// Guess why an attempt produced no file changes.
///
/// Checks the timed-out flag and exit code first, then scans stdout/stderr
/// (case-insensitive) for well-known diagnostics. Disk exhaustion wins over
/// permission errors because a full disk often surfaces as both.
pub fn classify_no_write(
    timed_out: bool,
    return_code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> FailureCause {
    if timed_out {
        return FailureCause::Timeout;
    }
    if return_code == Some(127) {
        return FailureCause::MissingCommand;
    }
    let haystack = format!("{}\n{}", stderr, stdout).to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| haystack.contains(m));
    if contains_any(DISK_MARKERS) {
        FailureCause::DiskFull
    } else if contains_any(PERMISSION_MARKERS) {
        FailureCause::PermissionDenied
    } else if contains_any(MISSING_COMMAND_MARKERS) || return_code == Some(126) {
        FailureCause::MissingCommand
    } else if contains_any(TIMEOUT_MARKERS) {
        FailureCause::Timeout
    } else {
        FailureCause::Generic
    }
}

/// Compiled set of gate-exemption globs (e.g. `**/*.md`, `docs/**`).
#[derive(Debug, Clone)]
pub struct Exemptions {
    set: Option<GlobSet>,
}

impl Exemptions {
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self { set: None });
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .with_context(|| format!("invalid exemption pattern '{pattern}'"))?;
            builder.add(glob);
        }
        let set = builder.build().context("build exemption globset")?;
        Ok(Self { set: Some(set) })
    }

    pub fn none() -> Self {
        Self { set: None }
    }

    /// True if there is at least one changed path and every one is exempt.
    pub fn covers_all<P: AsRef<Path>>(&self, changed_paths: &[P]) -> bool {
        let Some(set) = &self.set else {
            return false;
        };
        !changed_paths.is_empty() && changed_paths.iter().all(|p| set.is_match(p.as_ref()))
    }
}

/// True for paths under `.git` or the bookkeeping directory at the checkout root.
pub fn is_bookkeeping_path(path: &Path) -> bool {
    let mut components = path
        .components()
        .filter(|component| !matches!(component, Component::CurDir | Component::RootDir));

    match components.next() {
        Some(Component::Normal(name)) => name == STATE_DIR || name == ".git",
        _ => false,
    }
}
