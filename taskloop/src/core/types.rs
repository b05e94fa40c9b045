//! Shared deterministic types for the scheduling core.
//!
//! These types define stable contracts between the engine, the supervisor and
//! the persisted run state. They carry no I/O and serialize to a stable shape.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A unit of work as declared by the task source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub acceptance: Vec<String>,
    #[serde(default, deserialize_with = "lenient_ids")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<String>, depends_on: &[&str]) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            acceptance: Vec::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            status: TaskStatus::Open,
        }
    }
}

/// Status of a task as owned by the task source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Open,
    Done,
    Blocked,
    /// Only produced by lookups of unknown ids, never stored.
    Missing,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Missing => "missing",
        }
    }
}

/// Signal recorded on a finished iteration.
///
/// A history record without a signal is provisional: the pass that wrote it
/// has not reached its commit point yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitSignal {
    /// The selected task was committed and marked done.
    Done,
    /// The attempt failed and the task stays schedulable.
    Retry,
    /// The attempt failed and exhausted the task's attempt budget.
    Blocked,
    /// Nothing left to do.
    Complete,
    /// Tasks remain but every one of them is blocked.
    AllBlocked,
    /// The requested target could not be acted on.
    MissingTarget,
}

impl ExitSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitSignal::Done => "done",
            ExitSignal::Retry => "retry",
            ExitSignal::Blocked => "blocked",
            ExitSignal::Complete => "complete",
            ExitSignal::AllBlocked => "all_blocked",
            ExitSignal::MissingTarget => "missing_target",
        }
    }

    /// True for signals produced by target selection rather than an attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExitSignal::Complete | ExitSignal::AllBlocked | ExitSignal::MissingTarget
        )
    }
}

/// Probable cause of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    PermissionDenied,
    MissingCommand,
    DiskFull,
    Generic,
    GatesFailed,
    Workspace,
    Commit,
}

impl FailureCause {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCause::Timeout => "timeout",
            FailureCause::PermissionDenied => "permission_denied",
            FailureCause::MissingCommand => "missing_command",
            FailureCause::DiskFull => "disk_full",
            FailureCause::Generic => "generic",
            FailureCause::GatesFailed => "gates_failed",
            FailureCause::Workspace => "workspace",
            FailureCause::Commit => "commit",
        }
    }

    /// Operator-facing remediation hint for the cause.
    pub fn hint(self) -> &'static str {
        match self {
            FailureCause::Timeout => {
                "the agent hit its time limit; raise agent.timeout_secs or split the task"
            }
            FailureCause::PermissionDenied => {
                "the agent could not write to the checkout; check file ownership and the agent's sandbox/permission flags"
            }
            FailureCause::MissingCommand => {
                "a required program was not found; check agent.command and PATH"
            }
            FailureCause::DiskFull => "the disk is full; free space and rerun",
            FailureCause::Generic => {
                "the agent exited without changing any files; inspect agent.log and tighten the task's acceptance criteria"
            }
            FailureCause::GatesFailed => "gate commands failed; inspect gates.log",
            FailureCause::Workspace => {
                "the workspace could not be prepared; run `taskloop workspaces reclaim`"
            }
            FailureCause::Commit => "git commit failed; inspect the checkout's git state",
        }
    }
}

/// One immutable record per loop pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub task_id: Option<String>,
    pub exit_signal: Option<ExitSignal>,
    pub return_code: Option<i32>,
    #[serde(default)]
    pub gates_passed: bool,
    #[serde(default)]
    pub progress_made: bool,
    #[serde(default)]
    pub no_progress_streak: u32,
    pub timestamp: String,
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default)]
    pub changed_paths: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl IterationResult {
    /// A blank record for `iteration`, filled in by the engine as phases complete.
    pub fn new(iteration: u32, task_id: Option<String>, timestamp: String) -> Self {
        Self {
            iteration,
            task_id,
            exit_signal: None,
            return_code: None,
            gates_passed: false,
            progress_made: false,
            no_progress_streak: 0,
            timestamp,
            log_path: None,
            worker: None,
            timed_out: false,
            cause: None,
            hint: None,
            changed_paths: 0,
            duration_ms: None,
        }
    }
}

/// Why the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Complete,
    AllBlocked,
    NoProgress,
    RateLimited,
    MaxRuntime,
    MissingTarget,
    MaxIterations,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Complete => "complete",
            StopReason::AllBlocked => "all_blocked",
            StopReason::NoProgress => "no_progress",
            StopReason::RateLimited => "rate_limited",
            StopReason::MaxRuntime => "max_runtime",
            StopReason::MissingTarget => "missing_target",
            StopReason::MaxIterations => "max_iterations",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_to_id(&value).ok_or_else(|| serde::de::Error::custom("task id must be a string or number"))
}

/// Decode a dependency list, coercing anything malformed to empty.
fn lenient_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    let mut ids: Vec<String> = Vec::with_capacity(items.len());
    for id in items.iter().filter_map(value_to_id) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn lenient_strings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        Value::String(s) => vec![s],
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_depends_on_is_coerced_to_empty() {
        let task: Task = serde_json::from_str(r#"{"id": "a", "depends_on": "b"}"#).expect("parse");
        assert!(task.depends_on.is_empty());

        let task: Task = serde_json::from_str(r#"{"id": "a", "depends_on": null}"#).expect("parse");
        assert!(task.depends_on.is_empty());

        let task: Task = serde_json::from_str(r#"{"id": "a"}"#).expect("parse");
        assert!(task.depends_on.is_empty());
    }

    #[test]
    fn numeric_ids_are_normalized_and_duplicates_collapse() {
        let task: Task =
            serde_json::from_str(r#"{"id": 3, "depends_on": [1, "2", 1, {"x": 1}]}"#).expect("parse");
        assert_eq!(task.id, "3");
        assert_eq!(task.depends_on, vec!["1", "2"]);
        assert_eq!(task.status, TaskStatus::Open);
    }

    #[test]
    fn provisional_record_has_no_exit_signal() {
        let record = IterationResult::new(1, Some("t".to_string()), "now".to_string());
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["exit_signal"], Value::Null);
        assert!(json.get("cause").is_none());
    }
}
