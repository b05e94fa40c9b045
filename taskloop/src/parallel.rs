//! `taskloop run --workers N`: one supervisor process per worker.
//!
//! Workers coordinate only through the shared task file, claim markers and
//! the state document. The launcher cleans up after the previous session
//! before any worker starts, then waits for all of them.

use std::path::Path;
use std::process::{Child, Command};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::IterationResult;
use crate::exit_codes;
use crate::io::run_state::{StateStore, resume_interrupted};
use crate::io::task_source::{JsonTaskSource, TaskSource};
use crate::io::workspace::WorkspaceManager;

/// Global flags forwarded to every worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerFlags {
    pub quiet: bool,
    pub verbose: bool,
}

/// What the launcher cleaned up before spawning workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCleanup {
    pub resumed: Vec<IterationResult>,
    pub claims_cleared: usize,
    pub workspaces_removed: usize,
}

/// Command line for worker `index`.
pub fn worker_command(exe: &Path, root: &Path, index: usize, flags: WorkerFlags) -> Command {
    let mut cmd = Command::new(exe);
    cmd.arg("--root").arg(root);
    if flags.quiet {
        cmd.arg("--quiet");
    }
    if flags.verbose {
        cmd.arg("--verbose");
    }
    cmd.args(["run", "--worker", &index.to_string(), "--no-resume"]);
    cmd
}

/// Drop dangling records, stale claims and leftover workspaces.
///
/// Only safe while no worker is running.
#[instrument(skip_all)]
pub fn prepare_launch(
    store: &StateStore,
    source: &JsonTaskSource,
    workspaces: &WorkspaceManager,
) -> Result<LaunchCleanup> {
    store.ensure_dir()?;
    let resumed = resume_interrupted(store)?;
    let claims_cleared = source.clear_claims()?;
    let mut workspaces_removed = workspaces.reclaim_stale()?;
    for path in workspaces.list()? {
        workspaces.remove(&path)?;
        workspaces_removed += 1;
    }
    Ok(LaunchCleanup {
        resumed,
        claims_cleared,
        workspaces_removed,
    })
}

/// Exit code for the whole launch.
///
/// Shared task state decides first; otherwise the first failing worker's code.
pub fn combined_exit_code(all_done: bool, all_blocked: bool, worker_codes: &[i32]) -> i32 {
    if all_done {
        exit_codes::OK
    } else if all_blocked {
        exit_codes::ALL_BLOCKED
    } else {
        worker_codes
            .iter()
            .copied()
            .find(|code| *code != exit_codes::OK)
            .unwrap_or(exit_codes::OK)
    }
}

/// Spawn `workers` copies of `exe` and wait for all of them.
#[instrument(skip_all, fields(workers))]
pub fn launch_workers(
    exe: &Path,
    root: &Path,
    workers: usize,
    flags: WorkerFlags,
    source: &JsonTaskSource,
) -> Result<i32> {
    let mut children: Vec<(usize, Child)> = Vec::with_capacity(workers);
    for index in 0..workers {
        match worker_command(exe, root, index, flags).spawn() {
            Ok(child) => children.push((index, child)),
            Err(err) => {
                for (_, child) in &mut children {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(err).with_context(|| format!("spawn worker {index}"));
            }
        }
    }
    info!(workers, "workers started");

    let mut codes = Vec::with_capacity(workers);
    for (index, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("wait for worker {index}"))?;
        let code = status.code().unwrap_or_else(|| {
            warn!(worker = index, "worker terminated by signal");
            exit_codes::INVALID
        });
        info!(worker = index, code, "worker exited");
        codes.push(code);
    }

    Ok(combined_exit_code(
        source.all_done()?,
        source.all_blocked()?,
        &codes,
    ))
}
