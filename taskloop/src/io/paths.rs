//! Canonical locations under `.taskloop/` and project scaffolding.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;

use super::config::{EngineConfig, load_config, write_config};
use super::run_state::StateStore;
use super::task_source::JsonTaskSource;
use crate::core::classifier::STATE_DIR;

/// All fixed paths for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub claims_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        Self {
            config_path: state_dir.join("config.toml"),
            state_path: state_dir.join("state.json"),
            claims_dir: state_dir.join("claims"),
            state_dir,
            root,
        }
    }

    pub fn load_config(&self) -> Result<EngineConfig> {
        load_config(&self.config_path)
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.state_path)
    }

    pub fn task_source(&self, config: &EngineConfig) -> JsonTaskSource {
        JsonTaskSource::new(config.task_file_path(&self.root), &self.claims_dir)
    }
}

/// Files written by [`init_project`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub created: Vec<PathBuf>,
}

/// Write a default config and an empty task file where missing (or always
/// with `force`).
pub fn init_project(paths: &ProjectPaths, force: bool) -> Result<InitReport> {
    paths.state_store().ensure_dir()?;
    let mut report = InitReport::default();

    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &EngineConfig::default())?;
        report.created.push(paths.config_path.clone());
    }

    let config = paths.load_config()?;
    let task_file = config.task_file_path(&paths.root);
    if force || !task_file.exists() {
        write_empty_tasks(&task_file)?;
        report.created.push(task_file);
    }
    Ok(report)
}

fn write_empty_tasks(path: &Path) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(&json!({ "tasks": [] }))
        .context("serialize task file")?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())
}
