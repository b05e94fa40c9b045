//! Diagnostics and user-facing output.
//!
//! # Separation of Concerns
//!
//! - **Tracing ([`init`])**: dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of product output.
//!
//! - **Console ([`Console`])**: progress lines for the operator, passed
//!   explicitly to whoever prints them and silenced by `--quiet`.
//!
//! - **Iteration logging (`io/iteration_log`)**: product artifacts under
//!   `.taskloop/logs/`. Always written, unaffected by either of the above.

use std::io::Write;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`, or `info` when `verbose` is set.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=taskloop=debug taskloop run
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Operator-facing output settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Console {
    pub quiet: bool,
}

impl Console {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Progress line on stdout; dropped when quiet.
    pub fn line(&self, message: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        let mut out = std::io::stdout().lock();
        // A closed stdout must not abort the run.
        let _ = writeln!(out, "{}", message.as_ref());
    }

    /// Problem report on stderr; shown even when quiet.
    pub fn error(&self, message: impl AsRef<str>) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", message.as_ref());
    }
}
