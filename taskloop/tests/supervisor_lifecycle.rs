//! Supervisor-level lifecycle scenarios.
//!
//! These tests drive `run_supervisor` through several iterations against a
//! real git repository with scripted agents and gates, checking history,
//! commits, task statuses and the stop reason together.

use std::time::Duration;

use serde_json::json;
use taskloop::core::types::{ExitSignal, FailureCause, StopReason, TaskStatus};
use taskloop::io::task_source::TaskSource;
use taskloop::supervisor::{Supervisor, SupervisorOptions, run_supervisor};
use taskloop::test_support::{
    RecordingNotifier, ScriptedAgent, ScriptedGates, ScriptedRun, TestRepo,
};

/// Dependency chain with retries and a task that never succeeds.
///
/// Tasks: `a`, `b` (depends on `a`), `c` (independent). `max_attempts = 2`.
///
/// Execution sequence:
/// 1. `a`: agent exits 0 without writing → retry (generic)
/// 2. `a`: writes, gates pass → done
/// 3. `b`: writes, gates fail → retry (gates_failed)
/// 4. `b`: writes, gates pass → done
/// 5. `c`: agent exits 1 → retry
/// 6. `c`: agent exits 1 → blocked; nothing selectable → all_blocked
#[test]
fn chain_with_retries_ends_all_blocked() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks(&json!({
        "tasks": [
            {"id": "a", "title": "first"},
            {"id": "b", "title": "second", "depends_on": ["a"]},
            {"id": "c", "title": "doomed"},
        ]
    }))
    .expect("tasks");
    let mut config = repo.config();
    config.max_attempts = 2;
    config.limits.no_progress_limit = 0;

    let agent = ScriptedAgent::new(vec![
        ScriptedRun::noop(),
        ScriptedRun::writes("a.txt", "a"),
        ScriptedRun::writes("b.txt", "b1"),
        ScriptedRun::writes("b.txt", "b22"),
        ScriptedRun::fails(1, "boom"),
        ScriptedRun::fails(1, "boom"),
    ]);
    let gates = ScriptedGates::new(vec![true, false, true]);
    let notifier = RecordingNotifier::default();
    let store = repo.state_store();
    let source = repo.task_source();
    let commits_before = repo.commit_count("HEAD").expect("count");

    let sup = Supervisor {
        root: repo.path(),
        config: &config,
        store: &store,
        source: &source,
        agent: &agent,
        gates: &gates,
        notifier: &notifier,
        poll_interval: Duration::from_millis(10),
    };
    let mut seen = Vec::new();
    let outcome = run_supervisor(&sup, &SupervisorOptions::default(), |record| {
        seen.push((record.task_id.clone(), record.exit_signal));
    })
    .expect("run");

    assert_eq!(outcome.stop, StopReason::AllBlocked);
    assert_eq!(outcome.iterations, 6);
    assert_eq!(agent.remaining(), 0);
    // Gates only run when the agent succeeded and changed something.
    assert_eq!(gates.calls(), 3);

    let expected = [
        ("a", ExitSignal::Retry),
        ("a", ExitSignal::Done),
        ("b", ExitSignal::Retry),
        ("b", ExitSignal::Done),
        ("c", ExitSignal::Retry),
        ("c", ExitSignal::Blocked),
    ];
    let expected: Vec<_> = expected
        .iter()
        .map(|(id, signal)| (Some(id.to_string()), Some(*signal)))
        .collect();
    assert_eq!(seen, expected);

    let state = store.load().expect("state");
    let iterations: Vec<u32> = state.history.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(state.history[0].cause, Some(FailureCause::Generic));
    assert_eq!(state.history[2].cause, Some(FailureCause::GatesFailed));
    assert_eq!(state.attempts("a"), 1);
    assert_eq!(state.attempts("b"), 1);
    assert!(state.blocked_tasks.contains_key("c"));

    assert_eq!(repo.commit_count("HEAD").expect("count"), commits_before + 2);
    assert_eq!(source.lookup("a").expect("a").1, TaskStatus::Done);
    assert_eq!(source.lookup("b").expect("b").1, TaskStatus::Done);
    assert_eq!(source.lookup("c").expect("c").1, TaskStatus::Blocked);

    let titles: Vec<String> = notifier.seen().into_iter().map(|n| n.title).collect();
    assert_eq!(titles, vec!["taskloop stopped: all_blocked"]);
}

/// A worker-mode supervisor commits each task on its own workspace branch
/// and leaves the main checkout alone.
#[test]
fn worker_mode_commits_each_task_on_its_own_branch() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks(&json!([{"id": "alpha"}, {"id": "beta"}]))
        .expect("tasks");
    let config = repo.config();
    let agent = ScriptedAgent::new(vec![
        ScriptedRun::writes("alpha.txt", "alpha"),
        ScriptedRun::writes("beta.txt", "beta"),
    ]);
    let gates = ScriptedGates::passing();
    let notifier = RecordingNotifier::default();
    let store = repo.state_store();
    let source = repo.task_source();
    let main_commits = repo.commit_count("HEAD").expect("count");

    let sup = Supervisor {
        root: repo.path(),
        config: &config,
        store: &store,
        source: &source,
        agent: &agent,
        gates: &gates,
        notifier: &notifier,
        poll_interval: Duration::from_millis(10),
    };
    let options = SupervisorOptions {
        worker: Some(0),
        ..SupervisorOptions::default()
    };
    let outcome = run_supervisor(&sup, &options, |_| {}).expect("run");

    assert_eq!(outcome.stop, StopReason::Complete);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(repo.commit_count("HEAD").expect("count"), main_commits);
    for branch in ["taskloop/w0-alpha", "taskloop/w0-beta"] {
        assert_eq!(repo.commit_count(branch).expect("branch"), main_commits + 1);
    }
    assert!(!repo.path().join("alpha.txt").exists());
    assert!(source.claimed().expect("claims").is_empty());
    let workspaces = repo.path().join(".taskloop/workspaces");
    let leftover = std::fs::read_dir(&workspaces)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);

    let state = store.load().expect("state");
    assert!(state.history.iter().all(|r| r.worker == Some(0)));
}
