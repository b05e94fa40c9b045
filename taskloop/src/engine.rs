//! One pass of the iteration engine.
//!
//! A pass moves through [`Phase`]s: pick a target, prepare a checkout, run
//! the agent, verify the result with gates, then finalize (commit and mark
//! done, or count the failure). Every pass that selects a task or reaches a
//! terminal selection appends exactly one [`IterationResult`] to history.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{Exemptions, classify_no_write};
use crate::core::types::{ExitSignal, FailureCause, IterationResult, Task, TaskStatus};
use crate::io::agent::{AgentOutcome, AgentRequest, AgentRunner, render_prompt, write_agent_log};
use crate::io::config::EngineConfig;
use crate::io::changes::FileSnapshot;
use crate::io::gates::{GateReport, GateRequest, GateRunner, verify_changes, write_gate_log};
use crate::io::git::Git;
use crate::io::iteration_log::{IterationPaths, write_result};
use crate::io::run_state::{BlockedTask, RunState, StateStore, now_rfc3339};
use crate::io::task_source::TaskSource;
use crate::io::workspace::{Workspace, WorkspaceManager};

/// Engine phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SelectTarget,
    Prepare,
    Invoke,
    Verify,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::SelectTarget => "select",
            Phase::Prepare => "prepare",
            Phase::Invoke => "invoke",
            Phase::Verify => "verify",
            Phase::Finalize => "finalize",
        })
    }
}

/// Collaborators shared by every pass of one supervisor.
pub struct Engine<'a, S, A, G> {
    /// Main checkout; also the checkout used outside worker mode.
    pub root: &'a Path,
    pub config: &'a EngineConfig,
    pub store: &'a StateStore,
    pub source: &'a S,
    pub agent: &'a A,
    pub gates: &'a G,
    pub exemptions: &'a Exemptions,
    /// Present in worker mode.
    pub workspaces: Option<&'a WorkspaceManager>,
    pub session_id: &'a str,
}

/// Per-pass parameters.
#[derive(Debug, Clone)]
pub struct IterationRequest {
    /// Run this task instead of the next ready one.
    pub target: Option<String>,
    /// Allow a done or blocked target.
    pub force: bool,
    /// Worker index; set in worker mode.
    pub worker: Option<usize>,
    pub agent_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Finished(IterationResult),
    /// Worker mode only: nothing claimable while other workers hold claims.
    /// No record is written.
    Idle,
}

enum Selection {
    Task { task: Task, claimed: bool },
    Terminal {
        signal: ExitSignal,
        task_id: Option<String>,
        hint: String,
    },
    Idle,
}

/// Everything Invoke and Verify observed.
struct AttemptReport {
    agent: AgentOutcome,
    changed: Vec<PathBuf>,
    gates: GateReport,
    /// `Ok` when the change set was committed, otherwise why not.
    commit: std::result::Result<(), String>,
}

impl AttemptReport {
    fn succeeded(&self) -> bool {
        self.agent.succeeded() && !self.changed.is_empty() && self.gates.passed && self.commit.is_ok()
    }

    fn cause(&self) -> FailureCause {
        let agent = &self.agent;
        if !agent.succeeded() || self.changed.is_empty() {
            classify_no_write(agent.timed_out, agent.return_code, &agent.stdout, &agent.stderr)
        } else if !self.gates.passed {
            FailureCause::GatesFailed
        } else {
            FailureCause::Commit
        }
    }

    fn hint(&self, cause: FailureCause) -> String {
        match cause {
            FailureCause::GatesFailed if !self.gates.failed.is_empty() => {
                format!("{} (failed: {})", cause.hint(), self.gates.failed.join(", "))
            }
            FailureCause::Commit => match &self.commit {
                Err(detail) => format!("{}: {detail}", cause.hint()),
                Ok(()) => cause.hint().to_string(),
            },
            _ => match self.agent.return_code {
                Some(code) if code != 0 => {
                    format!("agent exited with code {code}; {}", cause.hint())
                }
                _ => cause.hint().to_string(),
            },
        }
    }
}

/// How a finished attempt changes the run state.
enum Effect {
    Done,
    Failed { cause: FailureCause, hint: String, counts: bool },
}

/// Run one pass.
///
/// Failures of the attempt itself (agent, gates, workspace) are recorded and
/// returned as a finished record. An `Err` means the engine could not do its
/// own bookkeeping; the pass is still recorded when possible.
#[instrument(skip_all, fields(target = ?request.target, worker = ?request.worker))]
pub fn run_iteration<S: TaskSource, A: AgentRunner, G: GateRunner>(
    engine: &Engine<'_, S, A, G>,
    request: &IterationRequest,
) -> Result<IterationOutcome> {
    let selection = select_target(engine, request)
        .with_context(|| format!("{} phase", Phase::SelectTarget))?;
    let (task, claimed) = match selection {
        Selection::Task { task, claimed } => (task, claimed),
        Selection::Terminal {
            signal,
            task_id,
            hint,
        } => {
            let record = append_terminal(engine, request, signal, task_id, hint)?;
            return Ok(IterationOutcome::Finished(record));
        }
        Selection::Idle => return Ok(IterationOutcome::Idle),
    };

    let result = attempt(engine, request, &task);
    if claimed && let Err(err) = engine.source.release(&task.id) {
        warn!(task_id = %task.id, err = %format!("{err:#}"), "failed to release claim");
    }
    result.map(IterationOutcome::Finished)
}

fn select_target<S: TaskSource, A, G>(
    engine: &Engine<'_, S, A, G>,
    request: &IterationRequest,
) -> Result<Selection> {
    if let Some(id) = &request.target {
        let (task, status) = engine.source.lookup(id)?;
        return Ok(match task {
            None => Selection::Terminal {
                signal: ExitSignal::MissingTarget,
                task_id: Some(id.clone()),
                hint: format!("no task with id '{id}'"),
            },
            Some(task) if status == TaskStatus::Open || request.force => Selection::Task {
                task,
                claimed: false,
            },
            Some(_) => Selection::Terminal {
                signal: ExitSignal::MissingTarget,
                task_id: Some(id.clone()),
                hint: format!(
                    "task '{id}' is {}; pass --force to run it anyway",
                    status.as_str()
                ),
            },
        });
    }

    let skip_blocked = engine.config.skip_blocked;
    let next = if request.worker.is_some() {
        engine
            .source
            .claim_next_task(skip_blocked)?
            .map(|task| (task, true))
    } else {
        engine
            .source
            .peek_next_task(skip_blocked)?
            .map(|task| (task, false))
    };
    if let Some((task, claimed)) = next {
        debug!(task_id = %task.id, claimed, "selected task");
        return Ok(Selection::Task { task, claimed });
    }
    if engine.source.all_done()? {
        return Ok(Selection::Terminal {
            signal: ExitSignal::Complete,
            task_id: None,
            hint: "every task is done".to_string(),
        });
    }
    if request.worker.is_some() && !engine.source.claimed()?.is_empty() {
        debug!("nothing claimable while other workers hold claims");
        return Ok(Selection::Idle);
    }
    Ok(Selection::Terminal {
        signal: ExitSignal::AllBlocked,
        task_id: None,
        hint: "every remaining task is blocked; see `taskloop status`".to_string(),
    })
}

fn append_terminal<S, A, G>(
    engine: &Engine<'_, S, A, G>,
    request: &IterationRequest,
    signal: ExitSignal,
    task_id: Option<String>,
    hint: String,
) -> Result<IterationResult> {
    let record = engine.store.update(|state| {
        let mut record = IterationResult::new(state.next_iteration(), task_id, now_rfc3339());
        record.exit_signal = Some(signal);
        record.worker = request.worker;
        record.no_progress_streak = state.no_progress_streak;
        record.hint = Some(hint);
        state.history.push(record.clone());
        record
    })?;
    info!(iteration = record.iteration, signal = ?signal, "terminal selection");
    Ok(record)
}

fn attempt<S: TaskSource, A: AgentRunner, G: GateRunner>(
    engine: &Engine<'_, S, A, G>,
    request: &IterationRequest,
    task: &Task,
) -> Result<IterationResult> {
    let started = Instant::now();

    // Prepare: the provisional record is crash evidence until Finalize
    // replaces it.
    let (mut record, failure) = engine
        .store
        .update(|state| {
            let mut record =
                IterationResult::new(state.next_iteration(), Some(task.id.clone()), now_rfc3339());
            record.worker = request.worker;
            let paths = IterationPaths::new(engine.store.state_dir(), engine.session_id, record.iteration);
            record.log_path = Some(paths.dir.display().to_string());
            state.history.push(record.clone());
            (record, previous_failure(state, &task.id))
        })
        .with_context(|| format!("{} phase", Phase::Prepare))?;
    let paths = IterationPaths::new(engine.store.state_dir(), engine.session_id, record.iteration);
    debug!(iteration = record.iteration, task_id = %task.id, "prepared iteration");

    let workspace = match (engine.workspaces, request.worker) {
        (Some(manager), Some(index)) => match manager.create(&task.id, index) {
            Ok(workspace) => Some(workspace),
            Err(err) => {
                warn!(err = %err, "workspace unavailable");
                record.duration_ms = Some(elapsed_ms(started));
                let effect = Effect::Failed {
                    cause: FailureCause::Workspace,
                    hint: format!("{}: {err}", FailureCause::Workspace.hint()),
                    counts: false,
                };
                return finalize(engine, task, record, &paths, effect);
            }
        },
        _ => None,
    };

    let checkout = workspace
        .as_ref()
        .map_or_else(|| engine.root.to_path_buf(), |w| w.path.clone());
    let report = invoke_and_verify(engine, request, task, &checkout, &paths, failure.as_deref());
    release_workspace(engine.workspaces, workspace.as_ref());

    let report = match report {
        Ok(report) => report,
        Err(err) => {
            record.duration_ms = Some(elapsed_ms(started));
            let effect = Effect::Failed {
                cause: FailureCause::Generic,
                hint: format!("internal error: {err:#}"),
                counts: false,
            };
            if let Err(record_err) = finalize(engine, task, record, &paths, effect) {
                warn!(err = %format!("{record_err:#}"), "failed to record interrupted iteration");
            }
            return Err(err);
        }
    };

    record.return_code = report.agent.return_code;
    record.timed_out = report.agent.timed_out;
    record.changed_paths = report.changed.len();
    record.progress_made = !report.changed.is_empty();
    record.gates_passed = report.agent.succeeded() && report.gates.passed;
    record.duration_ms = Some(elapsed_ms(started));

    let effect = if report.succeeded() {
        engine
            .source
            .mark_done(&task.id)
            .with_context(|| format!("{} phase", Phase::Finalize))?;
        Effect::Done
    } else {
        let cause = report.cause();
        Effect::Failed {
            hint: report.hint(cause),
            cause,
            counts: true,
        }
    };
    finalize(engine, task, record, &paths, effect)
}

/// Invoke the agent, diff the file set, run gates and commit on success.
fn invoke_and_verify<S, A: AgentRunner, G: GateRunner>(
    engine: &Engine<'_, S, A, G>,
    request: &IterationRequest,
    task: &Task,
    checkout: &Path,
    paths: &IterationPaths,
    failure: Option<&str>,
) -> Result<AttemptReport> {
    let config = engine.config;
    paths.create_dir()?;
    let before = FileSnapshot::capture(checkout)
        .with_context(|| format!("{} phase: snapshot checkout", Phase::Prepare))?;

    let prompt = render_prompt(&config.prompt_template, task, failure)?;
    let agent = engine
        .agent
        .run(&AgentRequest {
            workdir: checkout.to_path_buf(),
            prompt,
            timeout: request.agent_timeout,
            output_limit_bytes: config.agent.output_limit_bytes,
            stream_path: Some(paths.agent_log_path.clone()),
        })
        .with_context(|| format!("{} phase", Phase::Invoke))?;
    write_agent_log(&paths.agent_log_path, &agent)?;

    let after = FileSnapshot::capture(checkout)
        .with_context(|| format!("{} phase: snapshot checkout", Phase::Verify))?;
    let changed = after.changed_since(&before);
    debug!(changed = changed.len(), "file set diffed");

    let gates = if agent.succeeded() {
        verify_changes(
            engine.gates,
            &GateRequest {
                workdir: checkout.to_path_buf(),
                timeout: config.gate_timeout(),
                output_limit_bytes: config.gates.output_limit_bytes,
            },
            &changed,
            engine.exemptions,
        )
        .with_context(|| format!("{} phase", Phase::Verify))?
    } else {
        GateReport {
            passed: false,
            failed: Vec::new(),
            log: "gates not run: agent failed\n".to_string(),
        }
    };
    write_gate_log(&paths.gates_log_path, &gates)?;

    let commit = if agent.succeeded() && !changed.is_empty() && gates.passed {
        commit_checkout(checkout, task)
    } else {
        Err("not attempted".to_string())
    };

    Ok(AttemptReport {
        agent,
        changed,
        gates,
        commit,
    })
}

fn commit_checkout(checkout: &Path, task: &Task) -> std::result::Result<(), String> {
    let git = Git::new(checkout);
    let message = format!("taskloop: {} {}", task.id, task.title);
    let committed = git
        .add_all()
        .and_then(|()| git.commit_staged(message.trim_end()))
        .map_err(|err| format!("{err:#}"))?;
    if !committed {
        return Err("no committable changes (all changed paths are ignored by git)".to_string());
    }
    info!(task_id = %task.id, "changes committed");
    Ok(())
}

fn release_workspace(manager: Option<&WorkspaceManager>, workspace: Option<&Workspace>) {
    let (Some(manager), Some(workspace)) = (manager, workspace) else {
        return;
    };
    if let Err(err) = manager.remove(&workspace.path) {
        warn!(branch = %workspace.branch, err = %err, "failed to remove workspace");
    }
}

/// Hint left by the task's most recent failed attempt.
fn previous_failure(state: &RunState, task_id: &str) -> Option<String> {
    state
        .history
        .iter()
        .rev()
        .find(|r| r.task_id.as_deref() == Some(task_id) && r.exit_signal.is_some())
        .filter(|r| r.exit_signal == Some(ExitSignal::Retry))
        .and_then(|r| r.hint.clone())
}

/// Apply `effect` to the run state and replace the provisional record.
fn finalize<S: TaskSource, A, G>(
    engine: &Engine<'_, S, A, G>,
    task: &Task,
    mut record: IterationResult,
    paths: &IterationPaths,
    effect: Effect,
) -> Result<IterationResult> {
    let max_attempts = engine.config.max_attempts;
    let (record, blocked_reason) = engine
        .store
        .update(|state| {
            let streak = if record.progress_made {
                0
            } else {
                state.no_progress_streak.saturating_add(1)
            };
            state.no_progress_streak = streak;
            record.no_progress_streak = streak;

            let mut blocked_reason = None;
            match effect {
                Effect::Done => {
                    record.exit_signal = Some(ExitSignal::Done);
                    state.blocked_tasks.remove(&task.id);
                }
                Effect::Failed { cause, hint, counts } => {
                    record.cause = Some(cause);
                    let mut signal = ExitSignal::Retry;
                    if counts {
                        let attempts = state.attempts(&task.id) + 1;
                        state.task_attempts.insert(task.id.clone(), attempts);
                        if attempts >= max_attempts {
                            let reason = format!("{attempts} failed attempts; last: {hint}");
                            state.blocked_tasks.insert(
                                task.id.clone(),
                                BlockedTask {
                                    reason: reason.clone(),
                                    attempts,
                                    timestamp: now_rfc3339(),
                                },
                            );
                            blocked_reason = Some(reason);
                            signal = ExitSignal::Blocked;
                        }
                    }
                    record.exit_signal = Some(signal);
                    record.hint = Some(hint);
                }
            }
            replace_provisional(&mut state.history, record.clone());
            (record, blocked_reason)
        })
        .with_context(|| format!("{} phase", Phase::Finalize))?;

    if let Some(reason) = &blocked_reason {
        engine.source.mark_blocked(&task.id, reason)?;
    }
    if let Err(err) = write_result(paths, &record) {
        warn!(err = %format!("{err:#}"), "failed to write result.json");
    }
    info!(
        iteration = record.iteration,
        task_id = %task.id,
        signal = ?record.exit_signal,
        cause = ?record.cause,
        "iteration finished"
    );
    Ok(record)
}

/// Swap the provisional record for its final form, appending if it is gone.
fn replace_provisional(history: &mut Vec<IterationResult>, record: IterationResult) {
    let slot = history.iter().rposition(|r| {
        r.exit_signal.is_none() && r.iteration == record.iteration && r.worker == record.worker
    });
    match slot {
        Some(idx) => history[idx] = record,
        None => history.push(record),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
