//! Stable exit codes for taskloop CLI commands.

use crate::core::types::StopReason;

/// Every task is done (or the command succeeded).
pub const OK: i32 = 0;
/// Tasks remain but every one of them is blocked.
pub const ALL_BLOCKED: i32 = 1;
/// Invalid config, task file or arguments, or any other error.
pub const INVALID: i32 = 2;
/// The no-progress streak reached its limit.
pub const NO_PROGRESS: i32 = 3;
/// The invocation rate limit was reached under the `stop` policy.
pub const RATE_LIMITED: i32 = 4;
/// The wall-clock budget ran out.
pub const MAX_RUNTIME: i32 = 5;
/// The requested `--task` could not be acted on.
pub const MISSING_TARGET: i32 = 6;
/// The iteration budget ran out.
pub const MAX_ITERATIONS: i32 = 7;

pub fn for_stop(reason: StopReason) -> i32 {
    match reason {
        StopReason::Complete => OK,
        StopReason::AllBlocked => ALL_BLOCKED,
        StopReason::NoProgress => NO_PROGRESS,
        StopReason::RateLimited => RATE_LIMITED,
        StopReason::MaxRuntime => MAX_RUNTIME,
        StopReason::MissingTarget => MISSING_TARGET,
        StopReason::MaxIterations => MAX_ITERATIONS,
    }
}
