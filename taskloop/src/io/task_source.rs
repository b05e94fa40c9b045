//! Task sources: where tasks come from and where their status goes.
//!
//! The engine only talks to [`TaskSource`]. [`JsonTaskSource`] is the
//! file-backed adapter: a JSON task file plus a directory of claim markers
//! shared by all worker processes.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::dependency::{self, DependencyGraph};
use crate::core::types::{Task, TaskStatus};
use crate::io::FileLock;

/// Access to the task list.
///
/// Selection methods return the first ready task in input order. A ready
/// task has every dependency done and is neither done nor held by another
/// worker's claim. With `skip_blocked` false, selection stops (returns
/// `None`) at the first ready task that is blocked.
pub trait TaskSource {
    /// Next task without side effects.
    fn peek_next_task(&self, skip_blocked: bool) -> Result<Option<Task>>;
    /// Next task, claimed for this caller. At most one caller wins a task.
    fn claim_next_task(&self, skip_blocked: bool) -> Result<Option<Task>>;
    fn mark_done(&self, id: &str) -> Result<()>;
    fn mark_blocked(&self, id: &str, reason: &str) -> Result<()>;
    /// Drop this caller's claim on `id`. Releasing an unclaimed task is a no-op.
    fn release(&self, id: &str) -> Result<()>;
    fn all_done(&self) -> Result<bool>;
    /// Tasks remain, yet none can be selected and none is being worked on.
    fn all_blocked(&self) -> Result<bool>;
    /// Look up a task by id; unknown ids report [`TaskStatus::Missing`].
    fn lookup(&self, id: &str) -> Result<(Option<Task>, TaskStatus)>;
    fn tasks(&self) -> Result<Vec<Task>>;
    /// Ids currently held by a claim, in input order.
    fn claimed(&self) -> Result<Vec<String>>;
}

/// Parsed task file, keeping the raw JSON so rewrites preserve unknown keys.
struct TaskFile {
    tasks: Vec<Task>,
    raw: Value,
}

impl TaskFile {
    fn raw_tasks_mut(&mut self) -> Result<&mut Vec<Value>> {
        let list = match &mut self.raw {
            Value::Array(list) => list,
            Value::Object(map) => match map.get_mut("tasks") {
                Some(Value::Array(list)) => list,
                _ => bail!("task file has no `tasks` array"),
            },
            _ => bail!("task file must be an array or an object with `tasks`"),
        };
        Ok(list)
    }
}

/// JSON task file: `{"tasks": [...]}` or a bare array of task objects.
#[derive(Debug, Clone)]
pub struct JsonTaskSource {
    path: PathBuf,
    claims_dir: PathBuf,
}

impl JsonTaskSource {
    pub fn new(path: impl Into<PathBuf>, claims_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            claims_dir: claims_dir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove every claim marker. Only safe while no worker is running.
    pub fn clear_claims(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.claims_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read claims dir {}", self.claims_dir.display()));
            }
        };
        let mut cleared = 0;
        for entry in entries {
            let path = entry.context("read claim entry")?.path();
            if path.extension().is_some_and(|ext| ext == "claim") {
                fs::remove_file(&path)
                    .with_context(|| format!("remove claim {}", path.display()))?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(cleared, "cleared stale claims");
        }
        Ok(cleared)
    }

    fn load(&self) -> Result<TaskFile> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read task file {}", self.path.display()))?;
        let raw: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse task file {}", self.path.display()))?;
        let list = match &raw {
            Value::Array(list) => list,
            Value::Object(map) => match map.get("tasks") {
                Some(Value::Array(list)) => list,
                _ => bail!("task file {} has no `tasks` array", self.path.display()),
            },
            _ => bail!(
                "task file {} must be an array or an object with `tasks`",
                self.path.display()
            ),
        };
        let tasks = list
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                serde_json::from_value::<Task>(value.clone())
                    .with_context(|| format!("task #{idx} in {}", self.path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TaskFile { tasks, raw })
    }

    fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let _lock = FileLock::acquire(&self.claims_dir.join(".task-file.lock"))?;
        let mut file = self.load()?;
        let list = file.raw_tasks_mut()?;
        let entry = list
            .iter_mut()
            .find(|value| raw_id(value).as_deref() == Some(id))
            .ok_or_else(|| anyhow!("unknown task id '{id}'"))?;
        let Value::Object(map) = entry else {
            bail!("task '{id}' is not a JSON object");
        };
        map.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
        let mut buf = serde_json::to_string_pretty(&file.raw).context("serialize task file")?;
        buf.push('\n');
        super::write_atomic(&self.path, buf.as_bytes())?;
        debug!(id, status = status.as_str(), "task status written");
        Ok(())
    }

    fn claim_path(&self, id: &str) -> PathBuf {
        self.claims_dir.join(format!("{}.claim", encode_id(id)))
    }

    fn is_claimed(&self, id: &str) -> bool {
        self.claim_path(id).exists()
    }

    /// Exclusive creation of the marker is the claim: exactly one creator wins.
    fn try_claim(&self, id: &str) -> Result<bool> {
        fs::create_dir_all(&self.claims_dir)
            .with_context(|| format!("create claims dir {}", self.claims_dir.display()))?;
        let path = self.claim_path(id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "pid={}", std::process::id())
                    .with_context(|| format!("write claim {}", path.display()))?;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err).with_context(|| format!("create claim {}", path.display())),
        }
    }

    /// Claim `id` only if it is still open once the claim is held.
    ///
    /// Selection works from a snapshot of the task file; a sibling may have
    /// finished the task and dropped its claim since then.
    fn claim_if_open(&self, id: &str) -> Result<bool> {
        if !self.try_claim(id)? {
            return Ok(false);
        }
        let current = self.load()?;
        let open = current
            .tasks
            .iter()
            .any(|t| t.id == id && t.status == TaskStatus::Open);
        if !open {
            debug!(id, "task changed status before the claim, releasing");
            self.release(id)?;
        }
        Ok(open)
    }

    /// Walk ready tasks in input order, handing each selectable one to `accept`.
    fn select(
        &self,
        skip_blocked: bool,
        mut accept: impl FnMut(&Task) -> Result<bool>,
    ) -> Result<Option<Task>> {
        let file = self.load()?;
        let graph = dependency::build(&file.tasks);
        for task in ready_tasks(&file.tasks, &graph) {
            match task.status {
                TaskStatus::Blocked if skip_blocked => continue,
                TaskStatus::Blocked => return Ok(None),
                _ => {}
            }
            if accept(task)? {
                return Ok(Some(task.clone()));
            }
        }
        Ok(None)
    }
}

impl TaskSource for JsonTaskSource {
    fn peek_next_task(&self, skip_blocked: bool) -> Result<Option<Task>> {
        self.select(skip_blocked, |task| Ok(!self.is_claimed(&task.id)))
    }

    #[instrument(skip_all, fields(skip_blocked))]
    fn claim_next_task(&self, skip_blocked: bool) -> Result<Option<Task>> {
        let claimed = self.select(skip_blocked, |task| self.claim_if_open(&task.id))?;
        if let Some(task) = &claimed {
            debug!(id = %task.id, "claimed task");
        }
        Ok(claimed)
    }

    fn mark_done(&self, id: &str) -> Result<()> {
        self.set_status(id, TaskStatus::Done)
    }

    fn mark_blocked(&self, id: &str, reason: &str) -> Result<()> {
        info!(id, reason, "blocking task");
        self.set_status(id, TaskStatus::Blocked)
    }

    fn release(&self, id: &str) -> Result<()> {
        let path = self.claim_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("release claim {}", path.display())),
        }
    }

    fn all_done(&self) -> Result<bool> {
        let file = self.load()?;
        Ok(file.tasks.iter().all(|t| t.status == TaskStatus::Done))
    }

    fn all_blocked(&self) -> Result<bool> {
        let file = self.load()?;
        if file.tasks.iter().all(|t| t.status == TaskStatus::Done) {
            return Ok(false);
        }
        let graph = dependency::build(&file.tasks);
        let selectable = ready_tasks(&file.tasks, &graph).any(|t| t.status == TaskStatus::Open);
        let in_flight = file
            .tasks
            .iter()
            .any(|t| t.status != TaskStatus::Done && self.is_claimed(&t.id));
        Ok(!selectable && !in_flight)
    }

    fn lookup(&self, id: &str) -> Result<(Option<Task>, TaskStatus)> {
        let file = self.load()?;
        Ok(match file.tasks.into_iter().find(|t| t.id == id) {
            Some(task) => {
                let status = task.status;
                (Some(task), status)
            }
            None => (None, TaskStatus::Missing),
        })
    }

    fn tasks(&self) -> Result<Vec<Task>> {
        Ok(self.load()?.tasks)
    }

    fn claimed(&self) -> Result<Vec<String>> {
        let file = self.load()?;
        Ok(file
            .tasks
            .into_iter()
            .filter(|t| self.is_claimed(&t.id))
            .map(|t| t.id)
            .collect())
    }
}

/// Ready tasks (dependencies done, task not done) in input order.
pub fn ready_tasks<'a>(
    tasks: &'a [Task],
    graph: &DependencyGraph,
) -> impl Iterator<Item = &'a Task> {
    let completed: HashSet<String> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id.clone())
        .collect();
    let ready: HashSet<String> = dependency::ready(graph, &completed).into_iter().collect();
    let mut seen = HashSet::new();
    tasks
        .iter()
        .filter(move |t| ready.contains(&t.id) && seen.insert(t.id.clone()))
}

fn raw_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Filesystem-safe, collision-free encoding of a task id.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(tasks: Value) -> (tempfile::TempDir, JsonTaskSource) {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        fs::write(&path, serde_json::to_string_pretty(&tasks).expect("json")).expect("write");
        let src = JsonTaskSource::new(path, temp.path().join("claims"));
        (temp, src)
    }

    fn chain() -> Value {
        json!({"tasks": [
            {"id": 1, "title": "one", "depends_on": []},
            {"id": 2, "title": "two", "depends_on": [1]},
            {"id": 3, "title": "three", "depends_on": [1, 2]},
        ]})
    }

    #[test]
    fn peek_follows_dependencies_and_has_no_side_effects() {
        let (_temp, src) = source(chain());
        let first = src.peek_next_task(true).expect("peek").expect("task");
        assert_eq!(first.id, "1");
        assert_eq!(src.peek_next_task(true).expect("peek").expect("task").id, "1");

        src.mark_done("1").expect("done");
        assert_eq!(src.peek_next_task(true).expect("peek").expect("task").id, "2");
        src.mark_done("2").expect("done");
        src.mark_done("3").expect("done");
        assert_eq!(src.peek_next_task(true).expect("peek"), None);
        assert!(src.all_done().expect("all done"));
        assert!(!src.all_blocked().expect("all blocked"));
    }

    #[test]
    fn claims_are_exclusive_until_released() {
        let (_temp, src) = source(json!([
            {"id": "a"},
            {"id": "b"},
        ]));
        let other = src.clone();

        assert_eq!(src.claim_next_task(true).expect("claim").expect("a").id, "a");
        assert_eq!(other.claim_next_task(true).expect("claim").expect("b").id, "b");
        assert_eq!(other.claim_next_task(true).expect("claim"), None);
        assert_eq!(src.claimed().expect("claimed"), vec!["a".to_string(), "b".to_string()]);
        // Claimed work in flight is not "all blocked".
        assert!(!src.all_blocked().expect("all blocked"));

        src.release("a").expect("release");
        src.release("a").expect("release twice");
        assert_eq!(other.claim_next_task(true).expect("claim").expect("a").id, "a");
    }

    #[test]
    fn claim_skips_a_task_finished_after_the_file_was_read() {
        let (_temp, src) = source(json!([
            {"id": "a"},
            {"id": "b"},
        ]));
        let sibling = src.clone();

        // The sibling finishes `a` and drops its claim between our read of the
        // task file and our claim attempt.
        let picked = src
            .select(true, |task| {
                if task.id == "a" {
                    sibling.mark_done("a")?;
                    sibling.release("a")?;
                }
                src.claim_if_open(&task.id)
            })
            .expect("select")
            .expect("task");

        assert_eq!(picked.id, "b");
        assert_eq!(src.claimed().expect("claimed"), vec!["b".to_string()]);
        assert_eq!(src.lookup("a").expect("lookup").1, TaskStatus::Done);
    }

    #[test]
    fn skip_blocked_policy() {
        let (_temp, src) = source(json!([
            {"id": "a", "status": "blocked"},
            {"id": "b"},
        ]));
        assert_eq!(src.peek_next_task(true).expect("peek").expect("b").id, "b");
        assert_eq!(src.peek_next_task(false).expect("peek"), None);
        assert!(!src.all_blocked().expect("all blocked"));

        src.mark_blocked("b", "attempts exhausted").expect("block");
        assert!(src.all_blocked().expect("all blocked"));
    }

    #[test]
    fn cyclic_tasks_leave_everything_blocked() {
        let (_temp, src) = source(json!([
            {"id": "A", "depends_on": ["B"]},
            {"id": "B", "depends_on": ["A"]},
        ]));
        assert_eq!(src.peek_next_task(true).expect("peek"), None);
        assert!(src.all_blocked().expect("all blocked"));
    }

    #[test]
    fn status_rewrite_preserves_unknown_keys_and_shape() {
        let (_temp, src) = source(json!({
            "project": "demo",
            "tasks": [{"id": 7, "title": "seven", "owner": "ops"}],
        }));
        src.mark_done("7").expect("done");

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(src.path()).expect("read")).expect("parse");
        assert_eq!(raw["project"], "demo");
        assert_eq!(raw["tasks"][0]["owner"], "ops");
        assert_eq!(raw["tasks"][0]["status"], "done");
        assert_eq!(raw["tasks"][0]["id"], 7);
    }

    #[test]
    fn lookup_reports_missing() {
        let (_temp, src) = source(chain());
        let (task, status) = src.lookup("2").expect("lookup");
        assert_eq!(task.expect("task").title, "two");
        assert_eq!(status, TaskStatus::Open);
        assert_eq!(src.lookup("9").expect("lookup"), (None, TaskStatus::Missing));
        assert!(src.mark_done("9").is_err());
    }

    #[test]
    fn clear_claims_removes_markers() {
        let (_temp, src) = source(json!([{"id": "x/y"}]));
        assert!(src.claim_next_task(true).expect("claim").is_some());
        assert_eq!(src.clear_claims().expect("clear"), 1);
        assert!(src.claim_next_task(true).expect("claim").is_some());
    }

    #[test]
    fn encoded_ids_do_not_collide() {
        assert_ne!(encode_id("a/b"), encode_id("a-b"));
        assert_eq!(encode_id("t-1"), "t-1");
        assert_eq!(encode_id("a.b"), "a%2Eb");
    }
}
