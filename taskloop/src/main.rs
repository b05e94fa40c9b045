//! Dependency-aware task loop for coding agents.
//!
//! Picks the next ready task from `.taskloop/tasks.json`, runs the agent on
//! it, verifies the result with gate commands and commits, until the task set
//! is done or a stop policy fires.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use taskloop::cli::{self as commands, RunOptions};
use taskloop::exit_codes;
use taskloop::logging::{self, Console};
use taskloop::parallel::WorkerFlags;

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Dependency-aware task loop for coding agents"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Suppress progress lines.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log at info level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `.taskloop/config.toml` and an empty task file.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the loop until every task is done or a stop policy fires.
    Run(RunArgs),
    /// Print the ids of tasks whose dependencies are all done.
    Ready,
    /// Summarize tasks, the last iteration and blocked tasks.
    Status,
    /// Inspect or clean up worker workspaces.
    Workspaces {
        #[command(subcommand)]
        command: WorkspacesCommand,
    },
    /// Record a named recovery point of the checkout and run state.
    Snapshot {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Restore a snapshot taken with `taskloop snapshot`.
    Restore { name: String },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Work on this task only.
    #[arg(long = "task")]
    task: Option<String>,

    /// Allow `--task` to name a done or blocked task.
    #[arg(long, requires = "task")]
    force: bool,

    /// Run as worker N in its own workspace (used by `--workers`).
    #[arg(long, conflicts_with_all = ["task", "workers"])]
    worker: Option<usize>,

    /// Launch N workers in parallel, each in its own workspace.
    #[arg(long, conflicts_with = "task")]
    workers: Option<usize>,

    /// Keep a dangling last history record instead of dropping it.
    #[arg(long, hide = true)]
    no_resume: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum WorkspacesCommand {
    /// List managed workspace directories.
    List,
    /// Delete workspace directories git no longer tracks.
    Reclaim,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let console = Console::new(cli.quiet);
    let code = match run(cli, console) {
        Ok(code) => code,
        Err(err) => {
            console.error(format!("error: {err:#}"));
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli, console: Console) -> Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    match cli.command {
        Command::Init { force } => commands::init(&root, console, force),
        Command::Run(args) => {
            let flags = WorkerFlags {
                quiet: cli.quiet,
                verbose: cli.verbose,
            };
            commands::run(&root, console, flags, run_options(args))
        }
        Command::Ready => commands::ready(&root, console),
        Command::Status => commands::status(&root, console),
        Command::Workspaces { command } => match command {
            WorkspacesCommand::List => commands::workspaces_list(&root),
            WorkspacesCommand::Reclaim => commands::workspaces_reclaim(&root, console),
        },
        Command::Snapshot { name, description } => {
            commands::snapshot(&root, console, &name, description.as_deref())
        }
        Command::Restore { name } => commands::restore(&root, console, &name),
    }
}

fn run_options(args: RunArgs) -> RunOptions {
    RunOptions {
        target: args.task,
        force: args.force,
        worker: args.worker,
        workers: args.workers,
        resume: !args.no_resume,
    }
}
