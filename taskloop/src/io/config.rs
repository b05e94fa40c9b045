//! Engine configuration stored under `.taskloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::stop_policy::{NoProgressPolicy, RateLimitPolicy, StopPolicies};

pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
You are working on task {{ task.id }}: {{ task.title }}.
{% if task.acceptance %}
Acceptance criteria:
{% for item in task.acceptance %}- {{ item }}
{% endfor %}{% endif %}{% if failure %}
The previous attempt failed: {{ failure }}
{% endif %}
Make the smallest change that satisfies the criteria, then stop.
";

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that
/// work for a single local checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Task file, relative to the project root.
    pub task_file: PathBuf,

    /// Failed attempts allowed per task before it is blocked.
    pub max_attempts: u32,

    /// Pass over blocked tasks instead of stopping at the first one.
    pub skip_blocked: bool,

    /// Take a `session-start` snapshot when a supervisor starts.
    pub snapshot_on_start: bool,

    /// minijinja template rendered with `task` into the agent prompt.
    pub prompt_template: String,

    pub agent: AgentConfig,
    pub gates: GatesConfig,
    pub limits: LimitsConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Argv template. A literal `-` feeds the prompt on stdin; `{prompt}`
    /// inside an argument is substituted; otherwise the prompt is appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Stop at the first failing gate.
    #[default]
    FailFast,
    /// Run every gate and report all failures.
    RunAll,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateCommand {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatesConfig {
    pub policy: GatePolicy,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Globs; when every changed path matches, gates are skipped.
    pub exempt: Vec<String>,
    pub commands: Vec<GateCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub no_progress_limit: u32,
    pub no_progress_policy: NoProgressPolicy,
    pub max_calls_per_hour: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_policy: RateLimitPolicy,
    pub max_runtime_secs: u64,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Workspace root, relative to the project root unless absolute.
    pub root: PathBuf,
    pub branch_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_file: PathBuf::from(".taskloop/tasks.json"),
            max_attempts: 3,
            skip_blocked: true,
            snapshot_on_start: false,
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            agent: AgentConfig::default(),
            gates: GatesConfig::default(),
            limits: LimitsConfig::default(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            policy: GatePolicy::FailFast,
            timeout_secs: 15 * 60,
            output_limit_bytes: 100_000,
            exempt: vec!["**/*.md".to_string(), "docs/**".to_string()],
            commands: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            no_progress_limit: 3,
            no_progress_policy: NoProgressPolicy::Stop,
            max_calls_per_hour: 100,
            rate_limit_window_secs: 60 * 60,
            rate_limit_policy: RateLimitPolicy::Wait,
            max_runtime_secs: 0,
            max_iterations: 0,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".taskloop/workspaces"),
            branch_prefix: "taskloop".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.gates.timeout_secs == 0 {
            return Err(anyhow!("gates.timeout_secs must be > 0"));
        }
        if self.gates.output_limit_bytes == 0 {
            return Err(anyhow!("gates.output_limit_bytes must be > 0"));
        }
        for gate in &self.gates.commands {
            if gate.command.is_empty() || gate.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "gates.commands '{}' must have a non-empty command",
                    gate.name
                ));
            }
        }
        if self.limits.max_calls_per_hour > 0 && self.limits.rate_limit_window_secs == 0 {
            return Err(anyhow!("limits.rate_limit_window_secs must be > 0"));
        }
        if self.workspace.branch_prefix.trim().is_empty() {
            return Err(anyhow!("workspace.branch_prefix must be non-empty"));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gates.timeout_secs)
    }

    pub fn stop_policies(&self) -> StopPolicies {
        StopPolicies {
            no_progress_limit: self.limits.no_progress_limit,
            no_progress_policy: self.limits.no_progress_policy,
            rate_limit_policy: self.limits.rate_limit_policy,
            max_iterations: self.limits.max_iterations,
        }
    }

    pub fn task_file_path(&self, root: &Path) -> PathBuf {
        root.join(&self.task_file)
    }

    pub fn workspace_root(&self, root: &Path) -> PathBuf {
        root.join(&self.workspace.root)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.gates.commands.push(GateCommand {
            name: "test".to_string(),
            command: vec!["cargo".to_string(), "test".to_string()],
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_attempts = 5\n[gates]\npolicy = \"run_all\"\n[[gates.commands]]\nname = \"lint\"\ncommand = [\"just\", \"lint\"]\n[limits]\nno_progress_policy = \"continue\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.gates.policy, GatePolicy::RunAll);
        assert_eq!(cfg.gates.commands[0].name, "lint");
        assert_eq!(cfg.limits.no_progress_policy, NoProgressPolicy::Continue);
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn rejects_empty_gate_command() {
        let mut cfg = EngineConfig::default();
        cfg.gates.commands.push(GateCommand {
            name: "empty".to_string(),
            command: Vec::new(),
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("'empty'"));
    }
}
