//! Test-only helpers: throwaway git repositories and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::io::agent::{AgentOutcome, AgentRequest, AgentRunner};
use crate::io::config::EngineConfig;
use crate::io::gates::{GateReport, GateRequest, GateRunner};
use crate::io::notify::{Notification, Notifier};
use crate::io::run_state::StateStore;
use crate::io::task_source::JsonTaskSource;

/// A git repository in a temp dir with one commit (`README.md`, `.gitignore`).
///
/// `.taskloop/` is ignored so bookkeeping never lands in commits.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = fs::canonicalize(temp.path()).context("canonicalize temp dir")?;
        let repo = Self { _temp: temp, root };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "taskloop@example.com"])?;
        repo.git(&["config", "user.name", "taskloop tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.root.join("README.md"), "# fixture\n").context("write README")?;
        fs::write(repo.root.join(".gitignore"), ".taskloop/\n").context("write .gitignore")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Run git in the repo, failing on a nonzero exit.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Number of commits reachable from `rev`.
    pub fn commit_count(&self, rev: &str) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", rev])?;
        out.trim().parse().context("parse commit count")
    }

    /// Write the task file at the default location.
    pub fn write_tasks(&self, tasks: &Value) -> Result<PathBuf> {
        let path = self.root.join(EngineConfig::default().task_file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create task dir")?;
        }
        let mut buf = serde_json::to_string_pretty(tasks).context("serialize tasks")?;
        buf.push('\n');
        fs::write(&path, buf).context("write tasks")?;
        Ok(path)
    }

    /// Defaults with no gates and no exemptions.
    pub fn config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.gates.exempt.clear();
        cfg
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.root.join(".taskloop/state.json"))
    }

    pub fn task_source(&self) -> JsonTaskSource {
        JsonTaskSource::new(
            self.root.join(EngineConfig::default().task_file),
            self.root.join(".taskloop/claims"),
        )
    }
}

/// One scripted agent run.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    /// Files written (relative to the checkout) before "exiting".
    pub writes: Vec<(PathBuf, String)>,
    pub outcome: AgentOutcome,
}

impl ScriptedRun {
    /// Exit 0 after writing `contents` to `path`.
    pub fn writes(path: &str, contents: &str) -> Self {
        Self {
            writes: vec![(PathBuf::from(path), contents.to_string())],
            outcome: AgentOutcome {
                return_code: Some(0),
                ..AgentOutcome::default()
            },
        }
    }

    /// Exit 0 without touching anything.
    pub fn noop() -> Self {
        Self {
            writes: Vec::new(),
            outcome: AgentOutcome {
                return_code: Some(0),
                ..AgentOutcome::default()
            },
        }
    }

    /// Exit `code` with `stderr`, writing nothing.
    pub fn fails(code: i32, stderr: &str) -> Self {
        Self {
            writes: Vec::new(),
            outcome: AgentOutcome {
                return_code: Some(code),
                stderr: stderr.to_string(),
                ..AgentOutcome::default()
            },
        }
    }

    pub fn timed_out() -> Self {
        Self {
            writes: Vec::new(),
            outcome: AgentOutcome {
                return_code: None,
                timed_out: true,
                ..AgentOutcome::default()
            },
        }
    }
}

/// Agent that replays a queue of [`ScriptedRun`]s and records what it saw.
pub struct ScriptedAgent {
    runs: RefCell<VecDeque<ScriptedRun>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.runs.borrow().len()
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentOutcome> {
        self.requests.borrow_mut().push(request.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no runs left"))?;
        for (rel, contents) in &run.writes {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }
        Ok(run.outcome)
    }
}

/// Gate runner returning queued pass/fail results; passes once exhausted.
pub struct ScriptedGates {
    results: RefCell<VecDeque<bool>>,
    calls: Cell<usize>,
}

impl ScriptedGates {
    pub fn new(results: Vec<bool>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            calls: Cell::new(0),
        }
    }

    pub fn passing() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl GateRunner for ScriptedGates {
    fn run(&self, _request: &GateRequest) -> Result<GateReport> {
        self.calls.set(self.calls.get() + 1);
        let passed = self.results.borrow_mut().pop_front().unwrap_or(true);
        Ok(GateReport {
            passed,
            failed: if passed {
                Vec::new()
            } else {
                vec!["scripted".to_string()]
            },
            log: format!("scripted gates passed={passed}\n"),
        })
    }
}

/// Notifier that keeps every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: RefCell<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn seen(&self) -> Vec<Notification> {
        self.seen.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.seen.borrow_mut().push(notification.clone());
    }
}
