//! The persisted run state document (`.taskloop/state.json`).
//!
//! The document is only ever replaced as a whole: [`StateStore::update`]
//! re-reads the current file, applies a closure to a copy and renames a temp
//! file over the original. A crash mid-write leaves the previous document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::recovery::find_interrupted;
use crate::core::types::IterationResult;
use crate::io::FileLock;
use crate::io::git::Git;

/// Current UTC time in RFC 3339, the timestamp format used across state and logs.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Append-only; one record per loop pass.
    #[serde(default)]
    pub history: Vec<IterationResult>,
    #[serde(default)]
    pub task_attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub blocked_tasks: BTreeMap<String, BlockedTask>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(rename = "noProgressStreak", default)]
    pub no_progress_streak: u32,
    /// Keys written by other tools, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub reason: String,
    pub attempts: u32,
    pub timestamp: String,
}

/// A named recovery point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub timestamp: String,
    /// Stash commit of the working tree; `None` when the tree was clean.
    pub vcs_stash_ref: Option<String>,
    pub state_backup_path: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub vcs_commit: Option<String>,
}

impl RunState {
    pub fn fresh() -> Self {
        Self {
            created_at: Some(now_rfc3339()),
            session_id: None,
            history: Vec::new(),
            task_attempts: BTreeMap::new(),
            blocked_tasks: BTreeMap::new(),
            snapshots: Vec::new(),
            no_progress_streak: 0,
            extra: Map::new(),
        }
    }

    /// Number the next appended record will carry.
    pub fn next_iteration(&self) -> u32 {
        u32::try_from(self.history.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1)
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.task_attempts.get(task_id).copied().unwrap_or(0)
    }
}

/// File-backed home of the [`RunState`] document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the document, logs and snapshot backups.
    pub fn state_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Create the state directory and keep git out of it.
    pub fn ensure_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let ignore = dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, "*\n").with_context(|| format!("write {}", ignore.display()))?;
        }
        Ok(())
    }

    /// Load the document.
    ///
    /// A missing file is fresh state. A file that cannot be parsed is moved
    /// aside to `<file>.corrupt` and also yields fresh state.
    pub fn load(&self) -> Result<RunState> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no run state, starting fresh");
                return Ok(RunState::fresh());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        match serde_json::from_str::<RunState>(&contents) {
            Ok(state) => {
                debug!(records = state.history.len(), "run state loaded");
                Ok(state)
            }
            Err(err) => {
                let aside = sibling(&self.path, ".corrupt");
                warn!(
                    path = %self.path.display(),
                    aside = %aside.display(),
                    err = %err,
                    "run state is corrupt, moving it aside"
                );
                fs::rename(&self.path, &aside)
                    .with_context(|| format!("move corrupt state to {}", aside.display()))?;
                Ok(RunState::fresh())
            }
        }
    }

    /// Replace the document on disk.
    pub fn write(&self, state: &RunState) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(state).context("serialize run state")?;
        buf.push('\n');
        super::write_atomic(&self.path, buf.as_bytes())
    }

    /// Re-read the document, apply `apply` to it and write it back whole.
    ///
    /// Holds `<file>.lock` for the duration so concurrent workers never
    /// drop each other's records.
    pub fn update<T>(&self, apply: impl FnOnce(&mut RunState) -> T) -> Result<T> {
        let _lock = FileLock::acquire(&sibling(&self.path, ".lock"))?;
        let mut state = self.load()?;
        let out = apply(&mut state);
        self.write(&state)?;
        Ok(out)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Drop every dangling history record left by an unclean shutdown.
///
/// Returns the removed records in history order. When anything was removed
/// the no-progress streak restarts at zero.
#[instrument(skip_all)]
pub fn resume_interrupted(store: &StateStore) -> Result<Vec<IterationResult>> {
    let removed = store.update(|state| {
        let indices = find_interrupted(&state.history);
        let mut removed = Vec::with_capacity(indices.len());
        for idx in indices.into_iter().rev() {
            removed.push(state.history.remove(idx));
        }
        removed.reverse();
        if !removed.is_empty() {
            state.no_progress_streak = 0;
        }
        removed
    })?;
    for record in &removed {
        info!(
            iteration = record.iteration,
            worker = ?record.worker,
            task_id = ?record.task_id,
            "resumed after interrupted iteration"
        );
    }
    Ok(removed)
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if !ok {
        bail!("invalid snapshot name '{name}' (use letters, digits, '-', '_' or '.')");
    }
    Ok(())
}

/// Record a named recovery point: a stash commit of the checkout plus a
/// backup of the state document. An existing snapshot with the same name is
/// replaced.
#[instrument(skip_all, fields(name))]
pub fn create_snapshot(
    store: &StateStore,
    git: &Git,
    name: &str,
    description: Option<&str>,
) -> Result<Snapshot> {
    validate_snapshot_name(name)?;
    let vcs_stash_ref = git
        .stash_snapshot(&format!("taskloop snapshot {name}"))
        .context("stash working tree")?;
    let vcs_commit = git.head_sha().ok();

    let backup_path = store
        .state_dir()
        .join("snapshots")
        .join(format!("{name}.json"));
    let snapshot = Snapshot {
        name: name.to_string(),
        timestamp: now_rfc3339(),
        vcs_stash_ref,
        state_backup_path: backup_path.display().to_string(),
        description: description.map(str::to_string),
        vcs_commit,
    };

    let current = store.load()?;
    let mut buf = serde_json::to_string_pretty(&current).context("serialize state backup")?;
    buf.push('\n');
    super::write_atomic(&backup_path, buf.as_bytes())?;

    let record = snapshot.clone();
    store.update(move |state| {
        state.snapshots.retain(|s| s.name != record.name);
        state.snapshots.push(record);
    })?;
    info!(stash = ?snapshot.vcs_stash_ref, "snapshot created");
    Ok(snapshot)
}

/// Reapply a snapshot's stash onto the checkout and restore the state backup.
///
/// The snapshot list itself is kept from the current document so later
/// snapshots stay restorable.
#[instrument(skip_all, fields(name))]
pub fn restore_snapshot(store: &StateStore, git: &Git, name: &str) -> Result<Snapshot> {
    let current = store.load()?;
    let snapshot = current
        .snapshots
        .iter()
        .find(|s| s.name == name)
        .cloned()
        .ok_or_else(|| anyhow!("no snapshot named '{name}'"))?;

    let backup_path = PathBuf::from(&snapshot.state_backup_path);
    let contents = fs::read_to_string(&backup_path)
        .with_context(|| format!("read state backup {}", backup_path.display()))?;
    let mut restored: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse state backup {}", backup_path.display()))?;

    if let Some(stash_ref) = &snapshot.vcs_stash_ref {
        git.stash_apply(stash_ref)
            .with_context(|| format!("apply stash for snapshot '{name}'"))?;
    }

    restored.snapshots = current.snapshots;
    store.write(&restored)?;
    info!(records = restored.history.len(), "snapshot restored");
    Ok(snapshot)
}
