//! CLI command implementations.
//!
//! Each command returns the process exit code; errors map to
//! [`exit_codes::INVALID`] in `main`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::dependency;
use crate::core::types::{ExitSignal, IterationResult, TaskStatus};
use crate::exit_codes;
use crate::io::agent::CommandAgent;
use crate::io::config::EngineConfig;
use crate::io::gates::CommandGateRunner;
use crate::io::git::Git;
use crate::io::notify::TracingNotifier;
use crate::io::paths::{ProjectPaths, init_project};
use crate::io::run_state::{create_snapshot, restore_snapshot};
use crate::io::task_source::{TaskSource, ready_tasks};
use crate::io::workspace::WorkspaceManager;
use crate::logging::Console;
use crate::parallel::{WorkerFlags, launch_workers, prepare_launch};
use crate::supervisor::{DEFAULT_POLL_INTERVAL, Supervisor, SupervisorOptions, run_supervisor};

/// Options for `taskloop run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub target: Option<String>,
    pub force: bool,
    pub worker: Option<usize>,
    pub workers: Option<usize>,
    pub resume: bool,
}

pub fn init(root: &Path, console: Console, force: bool) -> Result<i32> {
    let report = init_project(&ProjectPaths::new(root), force)?;
    for path in &report.created {
        console.line(format!("init: wrote {}", path.display()));
    }
    Ok(exit_codes::OK)
}

pub fn run(root: &Path, console: Console, flags: WorkerFlags, options: RunOptions) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let config = paths.load_config()?;
    let store = paths.state_store();
    let source = paths.task_source(&config);
    // Fail early on an unreadable task file.
    source.tasks()?;

    if let Some(workers) = options.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        let workspaces = workspace_manager(root, &config);
        let cleanup = prepare_launch(&store, &source, &workspaces)?;
        debug!(?cleanup, "launch cleanup");
        if cleanup.claims_cleared > 0 || cleanup.workspaces_removed > 0 {
            console.line(format!(
                "run: cleared {} claim(s), removed {} workspace(s)",
                cleanup.claims_cleared, cleanup.workspaces_removed
            ));
        }
        let exe = std::env::current_exe().context("locate taskloop executable")?;
        let code = launch_workers(&exe, root, workers, flags, &source)?;
        console.line(format!("run: workers={workers} exit={code}"));
        return Ok(code);
    }

    let agent = CommandAgent::new(config.agent.command.clone());
    let gates = CommandGateRunner::new(config.gates.commands.clone(), config.gates.policy);
    let notifier = TracingNotifier;
    let sup = Supervisor {
        root,
        config: &config,
        store: &store,
        source: &source,
        agent: &agent,
        gates: &gates,
        notifier: &notifier,
        poll_interval: DEFAULT_POLL_INTERVAL,
    };
    let supervisor_options = SupervisorOptions {
        target: options.target,
        force: options.force,
        worker: options.worker,
        resume: options.resume,
    };
    let outcome = run_supervisor(&sup, &supervisor_options, |record| {
        console.line(describe(record));
    })?;
    console.line(format!(
        "run: stop={} iterations={} session={}",
        outcome.stop, outcome.iterations, outcome.session_id
    ));
    Ok(exit_codes::for_stop(outcome.stop))
}

/// One progress line per finished iteration.
pub fn describe(record: &IterationResult) -> String {
    let mut line = format!("iteration {}:", record.iteration);
    if let Some(worker) = record.worker {
        line.push_str(&format!(" worker={worker}"));
    }
    if let Some(task_id) = &record.task_id {
        line.push_str(&format!(" task={task_id}"));
    }
    match record.exit_signal {
        Some(signal) => line.push_str(&format!(" signal={}", signal.as_str())),
        None => line.push_str(" signal=pending"),
    }
    if let Some(cause) = record.cause {
        line.push_str(&format!(" cause={}", cause.as_str()));
    }
    if let Some(hint) = &record.hint {
        line.push_str(&format!(" hint=\"{hint}\""));
    }
    line
}

/// Print ready task ids, one per line. Cycles are reported on stderr.
pub fn ready(root: &Path, console: Console) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let config = paths.load_config()?;
    let source = paths.task_source(&config);
    let tasks = source.tasks()?;
    let graph = dependency::build(&tasks);
    for cycle in graph.cycles() {
        console.error(format!("warning: dependency cycle: {}", cycle.join(" -> ")));
    }
    let claimed: HashSet<String> = source.claimed()?.into_iter().collect();
    for task in ready_tasks(&tasks, &graph) {
        let mut line = task.id.clone();
        if task.status == TaskStatus::Blocked {
            line.push_str(" (blocked)");
        }
        if claimed.contains(&task.id) {
            line.push_str(" (claimed)");
        }
        // Ready ids are the command's product; print them even when quiet.
        println!("{line}");
    }
    Ok(exit_codes::OK)
}

pub fn status(root: &Path, console: Console) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let config = paths.load_config()?;
    let source = paths.task_source(&config);
    let state = paths.state_store().load()?;
    let tasks = source.tasks()?;
    let claimed = source.claimed()?;

    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    println!(
        "tasks: total={} done={} open={} blocked={} claimed={}",
        tasks.len(),
        count(TaskStatus::Done),
        count(TaskStatus::Open),
        count(TaskStatus::Blocked),
        claimed.len()
    );
    let attempts = state
        .history
        .iter()
        .filter(|r| !r.exit_signal.is_some_and(ExitSignal::is_terminal))
        .count();
    println!(
        "session: {} iterations={} attempts={} no_progress_streak={}",
        state.session_id.as_deref().unwrap_or("none"),
        state.history.len(),
        attempts,
        state.no_progress_streak
    );
    if let Some(last) = state.history.last() {
        println!("last: {}", describe(last));
    }
    for (id, blocked) in &state.blocked_tasks {
        println!(
            "blocked: {id} attempts={} since={} reason=\"{}\"",
            blocked.attempts, blocked.timestamp, blocked.reason
        );
    }

    let graph = dependency::build(&tasks);
    for cycle in graph.cycles() {
        println!("cycle: {}", cycle.join(" -> "));
    }
    for task in &tasks {
        if let Some(node) = graph.node(&task.id)
            && !node.blocked_by.is_empty()
            && !graph.is_cyclic(&task.id)
        {
            println!(
                "unschedulable: {} waits on {}",
                task.id,
                node.blocked_by.join(", ")
            );
        }
    }
    for snapshot in &state.snapshots {
        console.line(format!("snapshot: {} at {}", snapshot.name, snapshot.timestamp));
    }
    Ok(exit_codes::OK)
}

pub fn workspaces_list(root: &Path) -> Result<i32> {
    let config = ProjectPaths::new(root).load_config()?;
    for path in workspace_manager(root, &config).list()? {
        println!("{}", path.display());
    }
    Ok(exit_codes::OK)
}

pub fn workspaces_reclaim(root: &Path, console: Console) -> Result<i32> {
    let config = ProjectPaths::new(root).load_config()?;
    let reclaimed = workspace_manager(root, &config).reclaim_stale()?;
    console.line(format!("workspaces: reclaimed={reclaimed}"));
    Ok(exit_codes::OK)
}

pub fn snapshot(
    root: &Path,
    console: Console,
    name: &str,
    description: Option<&str>,
) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let store = paths.state_store();
    store.ensure_dir()?;
    let snapshot = create_snapshot(&store, &Git::new(root), name, description)?;
    console.line(format!(
        "snapshot: {} stash={} commit={}",
        snapshot.name,
        snapshot.vcs_stash_ref.as_deref().unwrap_or("none"),
        snapshot.vcs_commit.as_deref().unwrap_or("none")
    ));
    Ok(exit_codes::OK)
}

pub fn restore(root: &Path, console: Console, name: &str) -> Result<i32> {
    let store = ProjectPaths::new(root).state_store();
    let snapshot = restore_snapshot(&store, &Git::new(root), name)?;
    console.line(format!("restore: {} ({})", snapshot.name, snapshot.timestamp));
    Ok(exit_codes::OK)
}

fn workspace_manager(root: &Path, config: &EngineConfig) -> WorkspaceManager {
    WorkspaceManager::new(
        root,
        config.workspace_root(root),
        config.workspace.branch_prefix.clone(),
    )
}
