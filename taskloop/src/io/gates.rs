//! Gate commands: external checks that accept or reject an iteration's changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::Exemptions;
use crate::io::config::{GateCommand, GatePolicy};
use crate::io::process::{Capture, run_captured};

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Result of a gate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub passed: bool,
    /// Names of gates that failed, in run order.
    pub failed: Vec<String>,
    /// Contents of `gates.log`.
    pub log: String,
}

impl GateReport {
    pub fn skipped(reason: &str) -> Self {
        Self {
            passed: true,
            failed: Vec::new(),
            log: format!("gates skipped: {reason}\n"),
        }
    }
}

pub trait GateRunner {
    fn run(&self, request: &GateRequest) -> Result<GateReport>;
}

/// Runs configured argv gates in order.
#[derive(Debug, Clone)]
pub struct CommandGateRunner {
    gates: Vec<GateCommand>,
    policy: GatePolicy,
}

impl CommandGateRunner {
    pub fn new(gates: Vec<GateCommand>, policy: GatePolicy) -> Self {
        Self { gates, policy }
    }
}

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(gates = self.gates.len(), policy = ?self.policy))]
    fn run(&self, request: &GateRequest) -> Result<GateReport> {
        let mut log = String::new();
        let mut failed = Vec::new();
        for gate in &self.gates {
            let Some((program, args)) = gate.command.split_first() else {
                continue;
            };
            debug!(gate = %gate.name, "running gate");
            let mut cmd = Command::new(program);
            cmd.args(args).current_dir(&request.workdir);
            let capture = Capture {
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                tee_path: None,
            };
            let passed = match run_captured(cmd, None, capture) {
                Ok(output) => {
                    log.push_str(&output.render_log(&gate.name));
                    log.push_str(&format!(
                        "[{}] exit {:?}\n\n",
                        gate.name,
                        output.code
                    ));
                    output.success()
                }
                Err(err) => {
                    log.push_str(&format!("[{}] failed to run: {err:#}\n\n", gate.name));
                    false
                }
            };
            if !passed {
                warn!(gate = %gate.name, "gate failed");
                failed.push(gate.name.clone());
                if self.policy == GatePolicy::FailFast {
                    break;
                }
            }
        }
        info!(failed = failed.len(), "gates finished");
        Ok(GateReport {
            passed: failed.is_empty(),
            failed,
            log,
        })
    }
}

/// Run gates unless the change set makes them moot.
///
/// Nothing changed: gates are not run and the report fails. Every changed
/// path exempt: gates are skipped and the report passes.
pub fn verify_changes<G: GateRunner>(
    runner: &G,
    request: &GateRequest,
    changed: &[PathBuf],
    exemptions: &Exemptions,
) -> Result<GateReport> {
    if changed.is_empty() {
        return Ok(GateReport {
            passed: false,
            failed: Vec::new(),
            log: "gates not run: no files changed\n".to_string(),
        });
    }
    if exemptions.covers_all(changed) {
        debug!(changed = changed.len(), "all changes exempt from gates");
        return Ok(GateReport::skipped("every changed path is exempt"));
    }
    runner.run(request)
}

/// Write `gates.log`.
pub fn write_gate_log(path: &Path, report: &GateReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    fs::write(path, &report.log).with_context(|| format!("write gate log {}", path.display()))
}
