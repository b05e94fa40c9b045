//! Multi-iteration supervisor for `taskloop run`.
//!
//! Repeats engine passes and evaluates the stop policies after each one.
//! Owns the per-process rate limiter and wall-clock budget.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::budget::RunBudget;
use crate::core::classifier::Exemptions;
use crate::core::rate_limit::RateLimiter;
use crate::core::stop_policy::{LoopSignals, Verdict, evaluate};
use crate::core::types::{ExitSignal, IterationResult, StopReason, TaskStatus};
use crate::engine::{Engine, IterationOutcome, IterationRequest, run_iteration};
use crate::io::agent::AgentRunner;
use crate::io::config::EngineConfig;
use crate::io::gates::GateRunner;
use crate::io::git::Git;
use crate::io::notify::{Notification, Notifier};
use crate::io::run_state::{StateStore, create_snapshot, now_rfc3339, resume_interrupted};
use crate::io::task_source::TaskSource;
use crate::io::workspace::WorkspaceManager;

pub const SESSION_START_SNAPSHOT: &str = "session-start";

/// How long an idle worker waits before looking for work again.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Collaborators for one supervisor run.
pub struct Supervisor<'a, S, A, G, N> {
    pub root: &'a Path,
    pub config: &'a EngineConfig,
    pub store: &'a StateStore,
    pub source: &'a S,
    pub agent: &'a A,
    pub gates: &'a G,
    pub notifier: &'a N,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Run only this task.
    pub target: Option<String>,
    /// Allow a done or blocked target.
    pub force: bool,
    /// Worker index when launched by `run --workers`.
    pub worker: Option<usize>,
    /// Drop a dangling last record before starting.
    pub resume: bool,
}

/// Summary of a supervisor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOutcome {
    pub stop: StopReason,
    /// Passes that produced a record.
    pub iterations: u32,
    pub session_id: String,
    pub last: Option<IterationResult>,
}

/// Run passes until a stop policy fires.
///
/// `on_iteration` sees every finished record. Any error from the engine's own
/// bookkeeping stops the run immediately; a notification is sent either way.
pub fn run_supervisor<S, A, G, N, F>(
    sup: &Supervisor<'_, S, A, G, N>,
    options: &SupervisorOptions,
    mut on_iteration: F,
) -> Result<SupervisorOutcome>
where
    S: TaskSource,
    A: AgentRunner,
    G: GateRunner,
    N: Notifier,
    F: FnMut(&IterationResult),
{
    let result = supervise(sup, options, &mut on_iteration);
    let notification = match &result {
        Ok(outcome) => Notification::new(
            format!("taskloop stopped: {}", outcome.stop),
            format!(
                "{} iteration(s) in session {}",
                outcome.iterations, outcome.session_id
            ),
        ),
        Err(err) => Notification::new("taskloop failed", format!("{err:#}")),
    };
    sup.notifier.notify(&notification);
    result
}

#[instrument(skip_all, fields(worker = ?options.worker, target = ?options.target))]
fn supervise<S, A, G, N, F>(
    sup: &Supervisor<'_, S, A, G, N>,
    options: &SupervisorOptions,
    on_iteration: &mut F,
) -> Result<SupervisorOutcome>
where
    S: TaskSource,
    A: AgentRunner,
    G: GateRunner,
    F: FnMut(&IterationResult),
{
    let config = sup.config;
    let exemptions = Exemptions::new(&config.gates.exempt)?;
    sup.store.ensure_dir()?;

    if options.resume {
        for removed in resume_interrupted(sup.store)? {
            if let Some(task_id) = &removed.task_id {
                sup.source.release(task_id)?;
            }
        }
    }

    let session_id = Uuid::new_v4().to_string();
    sup.store.update(|state| {
        state.session_id = Some(session_id.clone());
        state.created_at.get_or_insert_with(now_rfc3339);
    })?;
    info!(session_id = %session_id, "session started");

    if config.snapshot_on_start && options.worker.is_none() {
        let git = Git::new(sup.root);
        if let Err(err) = create_snapshot(
            sup.store,
            &git,
            SESSION_START_SNAPSHOT,
            Some("taken when the session started"),
        ) {
            warn!(err = %format!("{err:#}"), "failed to take session-start snapshot");
        }
    }

    let workspaces = options.worker.map(|_| {
        WorkspaceManager::new(
            sup.root,
            config.workspace_root(sup.root),
            config.workspace.branch_prefix.clone(),
        )
    });
    let engine = Engine {
        root: sup.root,
        config,
        store: sup.store,
        source: sup.source,
        agent: sup.agent,
        gates: sup.gates,
        exemptions: &exemptions,
        workspaces: workspaces.as_ref(),
        session_id: &session_id,
    };

    let policies = config.stop_policies();
    let budget = RunBudget::new(
        Instant::now(),
        Duration::from_secs(config.limits.max_runtime_secs),
    );
    let mut limiter = RateLimiter::new(
        config.limits.max_calls_per_hour,
        Duration::from_secs(config.limits.rate_limit_window_secs),
    );
    let mut iterations = 0u32;
    let mut last: Option<IterationResult> = None;

    let stop = loop {
        let now = Instant::now();
        if budget.exceeded(now) {
            break StopReason::MaxRuntime;
        }
        let request = IterationRequest {
            target: options.target.clone(),
            force: options.force,
            worker: options.worker,
            agent_timeout: budget.cap(config.agent_timeout(), now),
        };
        let record = match run_iteration(&engine, &request)? {
            IterationOutcome::Finished(record) => record,
            IterationOutcome::Idle => {
                thread::sleep(sup.poll_interval);
                continue;
            }
        };
        iterations += 1;
        if agent_ran(&record) {
            limiter.record(Instant::now());
        }
        on_iteration(&record);

        let (all_done, all_blocked) = completion(sup.source, options, &record)?;
        let now = Instant::now();
        let signals = LoopSignals {
            last: &record,
            all_done,
            all_blocked,
            rate_wait: limiter.min_wait(now),
            runtime_exceeded: budget.exceeded(now),
            iterations_run: iterations,
        };
        let verdict = evaluate(&policies, &signals);
        last = Some(record);
        match verdict {
            Verdict::Continue => {}
            Verdict::Stop(reason) => break reason,
            Verdict::Wait(wait) => {
                let wait = budget.cap(wait, now);
                info!(wait_secs = wait.as_secs(), "rate limit reached; waiting");
                thread::sleep(wait);
            }
        }
    };

    info!(stop = %stop, iterations, "supervisor stopped");
    Ok(SupervisorOutcome {
        stop,
        iterations,
        session_id,
        last,
    })
}

fn agent_ran(record: &IterationResult) -> bool {
    record.return_code.is_some() || record.timed_out
}

/// `(all_done, all_blocked)` for the stop policies.
///
/// In target mode both refer to the target alone.
fn completion<S: TaskSource>(
    source: &S,
    options: &SupervisorOptions,
    record: &IterationResult,
) -> Result<(bool, bool)> {
    let Some(target) = &options.target else {
        return Ok((source.all_done()?, source.all_blocked()?));
    };
    let (_, status) = source.lookup(target)?;
    let blocked = record.exit_signal == Some(ExitSignal::Blocked)
        || (status == TaskStatus::Blocked && !options.force);
    Ok((status == TaskStatus::Done, blocked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stop_policy::RateLimitPolicy;
    use crate::test_support::{
        RecordingNotifier, ScriptedAgent, ScriptedGates, ScriptedRun, TestRepo,
    };
    use serde_json::json;

    fn supervise_with(
        repo: &TestRepo,
        config: &EngineConfig,
        agent: &ScriptedAgent,
        notifier: &RecordingNotifier,
        options: &SupervisorOptions,
    ) -> Result<SupervisorOutcome> {
        let store = repo.state_store();
        let source = repo.task_source();
        let gates = ScriptedGates::passing();
        let sup = Supervisor {
            root: repo.path(),
            config,
            store: &store,
            source: &source,
            agent,
            gates: &gates,
            notifier,
            poll_interval: Duration::from_millis(10),
        };
        run_supervisor(&sup, options, |_| {})
    }

    #[test]
    fn runs_until_every_task_is_done() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}, {"id": "b", "depends_on": ["a"]}]))
            .expect("tasks");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::writes("a.txt", "a"),
            ScriptedRun::writes("b.txt", "b"),
        ]);
        let notifier = RecordingNotifier::default();

        let outcome = supervise_with(
            &repo,
            &repo.config(),
            &agent,
            &notifier,
            &SupervisorOptions::default(),
        )
        .expect("run");

        assert_eq!(outcome.stop, StopReason::Complete);
        assert_eq!(outcome.iterations, 2);
        let state = repo.state_store().load().expect("state");
        assert_eq!(state.session_id.as_deref(), Some(outcome.session_id.as_str()));
        assert_eq!(state.history.len(), 2);
        assert!(state.created_at.is_some());
        let seen = notifier.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].title, "taskloop stopped: complete");
    }

    #[test]
    fn stops_when_no_progress_streak_hits_limit() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}])).expect("tasks");
        let mut config = repo.config();
        config.max_attempts = 10;
        config.limits.no_progress_limit = 2;
        let agent = ScriptedAgent::new(vec![ScriptedRun::noop(), ScriptedRun::noop()]);

        let outcome = supervise_with(
            &repo,
            &config,
            &agent,
            &RecordingNotifier::default(),
            &SupervisorOptions::default(),
        )
        .expect("run");

        assert_eq!(outcome.stop, StopReason::NoProgress);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.last.expect("last").no_progress_streak, 2);
    }

    #[test]
    fn stops_when_every_task_is_blocked() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}])).expect("tasks");
        let mut config = repo.config();
        config.max_attempts = 1;
        let agent = ScriptedAgent::new(vec![ScriptedRun::fails(1, "nope")]);

        let outcome = supervise_with(
            &repo,
            &config,
            &agent,
            &RecordingNotifier::default(),
            &SupervisorOptions::default(),
        )
        .expect("run");

        assert_eq!(outcome.stop, StopReason::AllBlocked);
        assert_eq!(outcome.iterations, 1);
    }

    #[test]
    fn iteration_and_rate_limits_stop_the_run() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]))
            .expect("tasks");
        let mut config = repo.config();
        config.limits.max_iterations = 1;
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::writes("a.txt", "a"),
            ScriptedRun::writes("b.txt", "b"),
        ]);
        let notifier = RecordingNotifier::default();

        let outcome =
            supervise_with(&repo, &config, &agent, &notifier, &SupervisorOptions::default())
                .expect("run");
        assert_eq!(outcome.stop, StopReason::MaxIterations);

        config.limits.max_iterations = 0;
        config.limits.max_calls_per_hour = 1;
        config.limits.rate_limit_policy = RateLimitPolicy::Stop;
        let outcome =
            supervise_with(&repo, &config, &agent, &notifier, &SupervisorOptions::default())
                .expect("run");
        assert_eq!(outcome.stop, StopReason::RateLimited);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(agent.remaining(), 0);
    }

    #[test]
    fn target_mode_stops_once_the_target_is_done() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}, {"id": "b"}])).expect("tasks");
        let agent = ScriptedAgent::new(vec![ScriptedRun::writes("b.txt", "b")]);
        let options = SupervisorOptions {
            target: Some("b".to_string()),
            ..SupervisorOptions::default()
        };

        let outcome = supervise_with(
            &repo,
            &repo.config(),
            &agent,
            &RecordingNotifier::default(),
            &options,
        )
        .expect("run");

        assert_eq!(outcome.stop, StopReason::Complete);
        assert_eq!(outcome.iterations, 1);
        let (_, status) = repo.task_source().lookup("a").expect("lookup");
        assert_eq!(status, TaskStatus::Open);
    }

    #[test]
    fn missing_target_stops_immediately() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}])).expect("tasks");
        let agent = ScriptedAgent::new(Vec::new());
        let options = SupervisorOptions {
            target: Some("nope".to_string()),
            ..SupervisorOptions::default()
        };

        let outcome = supervise_with(
            &repo,
            &repo.config(),
            &agent,
            &RecordingNotifier::default(),
            &options,
        )
        .expect("run");

        assert_eq!(outcome.stop, StopReason::MissingTarget);
        assert_eq!(
            outcome.last.and_then(|r| r.exit_signal),
            Some(ExitSignal::MissingTarget)
        );
    }

    #[test]
    fn resume_drops_the_dangling_record() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}])).expect("tasks");
        let store = repo.state_store();
        store.ensure_dir().expect("dir");
        store
            .update(|state| {
                state.history.push(IterationResult::new(
                    1,
                    Some("a".to_string()),
                    now_rfc3339(),
                ));
                state.no_progress_streak = 2;
            })
            .expect("seed");
        let agent = ScriptedAgent::new(vec![ScriptedRun::writes("a.txt", "a")]);
        let options = SupervisorOptions {
            resume: true,
            ..SupervisorOptions::default()
        };

        let outcome = supervise_with(
            &repo,
            &repo.config(),
            &agent,
            &RecordingNotifier::default(),
            &options,
        )
        .expect("run");

        assert_eq!(outcome.stop, StopReason::Complete);
        let state = store.load().expect("state");
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].iteration, 1);
        assert_eq!(state.history[0].exit_signal, Some(ExitSignal::Done));
    }

    #[test]
    fn snapshot_on_start_records_a_recovery_point() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a", "status": "done"}]))
            .expect("tasks");
        let mut config = repo.config();
        config.snapshot_on_start = true;
        let agent = ScriptedAgent::new(Vec::new());

        let outcome = supervise_with(
            &repo,
            &config,
            &agent,
            &RecordingNotifier::default(),
            &SupervisorOptions::default(),
        )
        .expect("run");

        assert_eq!(outcome.stop, StopReason::Complete);
        let state = repo.state_store().load().expect("state");
        assert_eq!(state.snapshots.len(), 1);
        assert_eq!(state.snapshots[0].name, SESSION_START_SNAPSHOT);
    }

    #[test]
    fn engine_errors_stop_the_run_and_notify() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks(&json!([{"id": "a"}])).expect("tasks");
        let agent = ScriptedAgent::new(Vec::new());
        let notifier = RecordingNotifier::default();

        let err = supervise_with(
            &repo,
            &repo.config(),
            &agent,
            &notifier,
            &SupervisorOptions::default(),
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("no runs left"));
        assert_eq!(notifier.seen()[0].title, "taskloop failed");
    }
}
