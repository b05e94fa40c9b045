//! Per-iteration log artifacts under `<state_dir>/logs/<session>/<iteration>/`.
//!
//! These are product output, written regardless of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::IterationResult;

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub agent_log_path: PathBuf,
    pub gates_log_path: PathBuf,
    pub result_path: PathBuf,
}

impl IterationPaths {
    pub fn new(state_dir: &Path, session_id: &str, iteration: u32) -> Self {
        let dir = state_dir
            .join("logs")
            .join(session_id)
            .join(iteration.to_string());
        Self {
            agent_log_path: dir.join("agent.log"),
            gates_log_path: dir.join("gates.log"),
            result_path: dir.join("result.json"),
            dir,
        }
    }

    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }
}

/// Write `result.json` for a finished iteration.
pub fn write_result(paths: &IterationPaths, result: &IterationResult) -> Result<()> {
    paths.create_dir()?;
    let mut buf = serde_json::to_string_pretty(result).context("serialize iteration result")?;
    buf.push('\n');
    fs::write(&paths.result_path, buf)
        .with_context(|| format!("write {}", paths.result_path.display()))
}
