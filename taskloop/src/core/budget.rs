//! Wall-clock budget for a supervisor run.

use std::time::{Duration, Instant};

/// Tracks elapsed time against an optional maximum runtime.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    started: Instant,
    max_runtime: Option<Duration>,
}

impl RunBudget {
    /// `max_runtime` of zero means unlimited.
    pub fn new(started: Instant, max_runtime: Duration) -> Self {
        Self {
            started,
            max_runtime: (!max_runtime.is_zero()).then_some(max_runtime),
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn exceeded(&self, now: Instant) -> bool {
        self.max_runtime
            .is_some_and(|max| self.elapsed(now) >= max)
    }

    /// Clamp a subprocess timeout so it cannot outlive the run budget.
    ///
    /// Never returns zero; an exhausted budget still gets one second so the
    /// child is spawned and reported as timed out instead of skipped.
    pub fn cap(&self, timeout: Duration, now: Instant) -> Duration {
        let Some(max) = self.max_runtime else {
            return timeout;
        };
        let remaining = max.saturating_sub(self.elapsed(now));
        timeout.min(remaining).max(Duration::from_secs(1))
    }
}
