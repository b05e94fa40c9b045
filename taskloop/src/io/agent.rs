//! Coding-agent invocation.
//!
//! The [`AgentRunner`] trait decouples the iteration engine from the actual
//! agent backend. [`CommandAgent`] spawns the configured argv template; tests
//! use scripted runners that edit the checkout directly.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Task;
use crate::io::process::{Capture, SpawnError, run_captured};

/// Placeholder argument meaning "feed the prompt on stdin".
const STDIN_PLACEHOLDER: &str = "-";
const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Parameters for one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Checkout the agent works in.
    pub workdir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Stdout is streamed here while the agent runs.
    pub stream_path: Option<PathBuf>,
}

/// What the agent run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutcome {
    /// `None` when the process was killed (including on timeout).
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl AgentOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.return_code == Some(0)
    }

    /// Contents of `agent.log`.
    pub fn render_log(&self) -> String {
        let mut buf = format!("return_code: {:?}\ntimed_out: {}\n", self.return_code, self.timed_out);
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout);
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        buf.push('\n');
        buf
    }
}

/// Abstraction over agent backends.
pub trait AgentRunner {
    fn run(&self, request: &AgentRequest) -> Result<AgentOutcome>;
}

/// Concrete argv and stdin for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

/// Expand an argv template around `prompt`.
///
/// A literal `-` argument routes the prompt through stdin. Otherwise every
/// `{prompt}` inside an argument is substituted, and when the template has
/// neither the prompt becomes the final argument.
pub fn build_invocation(template: &[String], prompt: &str) -> Result<Invocation> {
    if template.first().is_none_or(|program| program.trim().is_empty()) {
        return Err(anyhow!("agent command is empty"));
    }
    if template.iter().skip(1).any(|arg| arg == STDIN_PLACEHOLDER) {
        return Ok(Invocation {
            argv: template.to_vec(),
            stdin: Some(prompt.to_string()),
        });
    }
    if template.iter().any(|arg| arg.contains(PROMPT_PLACEHOLDER)) {
        let argv = template
            .iter()
            .map(|arg| arg.replace(PROMPT_PLACEHOLDER, prompt))
            .collect();
        return Ok(Invocation { argv, stdin: None });
    }
    let mut argv = template.to_vec();
    argv.push(prompt.to_string());
    Ok(Invocation { argv, stdin: None })
}

/// Agent launched from an argv template.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl AgentRunner for CommandAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest) -> Result<AgentOutcome> {
        let invocation = build_invocation(&self.command, &request.prompt)?;
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let capture = Capture {
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
            tee_path: request.stream_path.as_deref(),
        };
        let output = match run_captured(cmd, invocation.stdin.as_deref().map(str::as_bytes), capture)
        {
            Ok(output) => output,
            Err(err) => match spawn_failure(&err) {
                Some(spawn) => return Ok(spawn_outcome(spawn)),
                None => return Err(err).context("run agent"),
            },
        };

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        }
        debug!(return_code = ?output.code, "agent finished");
        Ok(AgentOutcome {
            return_code: output.code,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            timed_out: output.timed_out,
        })
    }
}

fn spawn_failure(err: &anyhow::Error) -> Option<&SpawnError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SpawnError>())
}

/// An agent that never started is a failed attempt, not a failed run.
///
/// Exit codes follow the shell: 127 for a missing program, 126 for one that
/// cannot be executed.
fn spawn_outcome(spawn: &SpawnError) -> AgentOutcome {
    let program = &spawn.program;
    let (return_code, stderr) = match spawn.source.kind() {
        ErrorKind::NotFound => (127, format!("{program}: command not found")),
        ErrorKind::PermissionDenied => (126, format!("{program}: {}", spawn.source)),
        _ => (1, format!("{program}: cannot start agent: {}", spawn.source)),
    };
    warn!(program, return_code, err = %spawn.source, "agent could not be started");
    AgentOutcome {
        return_code: Some(return_code),
        stdout: String::new(),
        stderr,
        timed_out: false,
    }
}

/// Render the agent prompt for `task`.
///
/// `failure` carries the remediation hint from the task's previous failed
/// attempt, if any.
pub fn render_prompt(template: &str, task: &Task, failure: Option<&str>) -> Result<String> {
    let env = Environment::new();
    let rendered = env
        .render_str(
            template,
            context! {
                task => task,
                failure => failure.map(str::trim).filter(|s| !s.is_empty()),
            },
        )
        .context("render prompt template")?;
    Ok(rendered)
}

/// Write `agent.log` for an outcome.
pub fn write_agent_log(path: &Path, outcome: &AgentOutcome) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    std::fs::write(path, outcome.render_log())
        .with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dash_placeholder_uses_stdin() {
        let inv = build_invocation(&argv(&["claude", "--print", "-"]), "do it").expect("build");
        assert_eq!(inv.argv, argv(&["claude", "--print", "-"]));
        assert_eq!(inv.stdin.as_deref(), Some("do it"));
    }

    #[test]
    fn prompt_placeholder_is_substituted() {
        let inv =
            build_invocation(&argv(&["agent", "--message={prompt}"]), "fix").expect("build");
        assert_eq!(inv.argv, argv(&["agent", "--message=fix"]));
        assert_eq!(inv.stdin, None);
    }

    #[test]
    fn prompt_is_appended_without_placeholders() {
        let inv = build_invocation(&argv(&["agent", "run"]), "fix").expect("build");
        assert_eq!(inv.argv, argv(&["agent", "run", "fix"]));
        assert!(build_invocation(&[], "fix").is_err());
    }

    #[test]
    fn missing_program_reports_127() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(argv(&["taskloop-no-such-agent-binary", "-"]));
        let outcome = agent
            .run(&AgentRequest {
                workdir: temp.path().to_path_buf(),
                prompt: "hi".to_string(),
                timeout: Duration::from_secs(5),
                output_limit_bytes: 1_000,
                stream_path: None,
            })
            .expect("run");
        assert_eq!(outcome.return_code, Some(127));
        assert!(outcome.stderr.contains("command not found"));
        assert!(!outcome.succeeded());
    }

    #[test]
    fn non_executable_program_reports_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        use crate::core::classifier::classify_no_write;
        use crate::core::types::FailureCause;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).expect("chmod");

        let agent = CommandAgent::new(vec![script.display().to_string(), "-".to_string()]);
        let outcome = agent
            .run(&AgentRequest {
                workdir: temp.path().to_path_buf(),
                prompt: "hi".to_string(),
                timeout: Duration::from_secs(5),
                output_limit_bytes: 1_000,
                stream_path: None,
            })
            .expect("run");
        assert_eq!(outcome.return_code, Some(126));
        assert!(!outcome.succeeded());
        assert_eq!(
            classify_no_write(outcome.timed_out, outcome.return_code, &outcome.stdout, &outcome.stderr),
            FailureCause::PermissionDenied
        );
    }

    #[test]
    fn runs_in_workdir_and_reads_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(argv(&["sh", "-c", "cat > prompt.txt; echo ok", "-"]));
        let outcome = agent
            .run(&AgentRequest {
                workdir: temp.path().to_path_buf(),
                prompt: "write this".to_string(),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1_000,
                stream_path: None,
            })
            .expect("run");
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "ok\n");
        let written = std::fs::read_to_string(temp.path().join("prompt.txt")).expect("read");
        assert_eq!(written, "write this");
    }

    #[test]
    fn renders_task_fields_and_failure() {
        let mut task = Task::new("t-1", &[]);
        task.title = "Add login".to_string();
        task.acceptance = vec!["form renders".to_string()];
        let out = render_prompt(
            "{{ task.id }}|{{ task.title }}|{% for a in task.acceptance %}{{ a }}{% endfor %}|{{ failure }}",
            &task,
            Some(" gates failed "),
        )
        .expect("render");
        assert_eq!(out, "t-1|Add login|form renders|gates failed");
    }
}
