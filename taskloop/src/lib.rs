//! Dependency-aware task loop for coding agents.
//!
//! A supervisor repeatedly asks the iteration engine for one pass: pick the
//! next ready task, run an agent on it, verify the change with gate commands,
//! then commit and mark the task done or count the failure. Several
//! supervisors can run in parallel, each in its own git worktree.
//!
//! - **[`core`]**: Pure, deterministic logic (dependency graph, failure
//!   classification, stop policies, rate and runtime budgets). No I/O.
//! - **[`io`]**: Side-effecting adapters (task file, run state, git,
//!   workspaces, subprocesses). Isolated behind traits where tests need fakes.
//!
//! Orchestration modules ([`engine`], [`supervisor`], [`parallel`]) combine
//! the two; [`cli`] implements the commands.

pub mod cli;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod parallel;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
