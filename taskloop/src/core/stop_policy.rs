//! Stop policies evaluated by the supervisor after every iteration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::{ExitSignal, IterationResult, StopReason};

/// What to do once the no-progress streak reaches its limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoProgressPolicy {
    #[default]
    Stop,
    Continue,
}

/// What to do when the invocation rate limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    Stop,
    #[default]
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicies {
    /// Zero disables the no-progress check.
    pub no_progress_limit: u32,
    pub no_progress_policy: NoProgressPolicy,
    pub rate_limit_policy: RateLimitPolicy,
    /// Zero disables the iteration cap.
    pub max_iterations: u32,
}

/// Facts gathered after an iteration, fed to [`evaluate`].
#[derive(Debug, Clone, Copy)]
pub struct LoopSignals<'a> {
    pub last: &'a IterationResult,
    pub all_done: bool,
    pub all_blocked: bool,
    pub rate_wait: Option<Duration>,
    pub runtime_exceeded: bool,
    pub iterations_run: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop(StopReason),
    Wait(Duration),
}

/// Apply the stop policies in order: targeting failure, completion, all
/// blocked, no progress, rate limit, runtime, iteration cap.
pub fn evaluate(policies: &StopPolicies, signals: &LoopSignals<'_>) -> Verdict {
    let signal = signals.last.exit_signal;
    if signal == Some(ExitSignal::MissingTarget) {
        return Verdict::Stop(StopReason::MissingTarget);
    }
    if signal == Some(ExitSignal::Complete) || signals.all_done {
        return Verdict::Stop(StopReason::Complete);
    }
    if signal == Some(ExitSignal::AllBlocked) || signals.all_blocked {
        return Verdict::Stop(StopReason::AllBlocked);
    }
    if policies.no_progress_limit > 0
        && signals.last.no_progress_streak >= policies.no_progress_limit
        && policies.no_progress_policy == NoProgressPolicy::Stop
    {
        return Verdict::Stop(StopReason::NoProgress);
    }
    if let Some(wait) = signals.rate_wait {
        return match policies.rate_limit_policy {
            RateLimitPolicy::Stop => Verdict::Stop(StopReason::RateLimited),
            RateLimitPolicy::Wait => Verdict::Wait(wait),
        };
    }
    if signals.runtime_exceeded {
        return Verdict::Stop(StopReason::MaxRuntime);
    }
    if policies.max_iterations > 0 && signals.iterations_run >= policies.max_iterations {
        return Verdict::Stop(StopReason::MaxIterations);
    }
    Verdict::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policies() -> StopPolicies {
        StopPolicies {
            no_progress_limit: 3,
            no_progress_policy: NoProgressPolicy::Stop,
            rate_limit_policy: RateLimitPolicy::Stop,
            max_iterations: 0,
        }
    }

    fn last(signal: ExitSignal, streak: u32) -> IterationResult {
        let mut r = IterationResult::new(1, Some("t".to_string()), "ts".to_string());
        r.exit_signal = Some(signal);
        r.no_progress_streak = streak;
        r
    }

    fn signals(last: &IterationResult) -> LoopSignals<'_> {
        LoopSignals {
            last,
            all_done: false,
            all_blocked: false,
            rate_wait: None,
            runtime_exceeded: false,
            iterations_run: 1,
        }
    }

    #[test]
    fn completion_comes_first() {
        let record = last(ExitSignal::Retry, 10);
        let mut s = signals(&record);
        s.all_done = true;
        s.all_blocked = true;
        s.runtime_exceeded = true;
        assert_eq!(evaluate(&policies(), &s), Verdict::Stop(StopReason::Complete));
    }

    #[test]
    fn all_blocked_beats_no_progress() {
        let record = last(ExitSignal::Blocked, 10);
        let mut s = signals(&record);
        s.all_blocked = true;
        assert_eq!(evaluate(&policies(), &s), Verdict::Stop(StopReason::AllBlocked));
    }

    #[test]
    fn no_progress_stops_or_continues_per_policy() {
        let record = last(ExitSignal::Retry, 3);
        let s = signals(&record);
        assert_eq!(evaluate(&policies(), &s), Verdict::Stop(StopReason::NoProgress));

        let lenient = StopPolicies {
            no_progress_policy: NoProgressPolicy::Continue,
            ..policies()
        };
        assert_eq!(evaluate(&lenient, &s), Verdict::Continue);
    }

    #[test]
    fn rate_limit_waits_or_stops() {
        let record = last(ExitSignal::Done, 0);
        let mut s = signals(&record);
        s.rate_wait = Some(Duration::from_secs(5));
        assert_eq!(evaluate(&policies(), &s), Verdict::Stop(StopReason::RateLimited));

        let waiting = StopPolicies {
            rate_limit_policy: RateLimitPolicy::Wait,
            ..policies()
        };
        assert_eq!(evaluate(&waiting, &s), Verdict::Wait(Duration::from_secs(5)));
    }

    #[test]
    fn runtime_then_iteration_cap() {
        let record = last(ExitSignal::Done, 0);
        let mut s = signals(&record);
        s.runtime_exceeded = true;
        let capped = StopPolicies {
            max_iterations: 1,
            ..policies()
        };
        assert_eq!(evaluate(&capped, &s), Verdict::Stop(StopReason::MaxRuntime));
        s.runtime_exceeded = false;
        assert_eq!(evaluate(&capped, &s), Verdict::Stop(StopReason::MaxIterations));
        assert_eq!(evaluate(&policies(), &s), Verdict::Continue);
    }

    #[test]
    fn missing_target_stops_immediately() {
        let record = last(ExitSignal::MissingTarget, 0);
        let mut s = signals(&record);
        s.all_done = true;
        assert_eq!(evaluate(&policies(), &s), Verdict::Stop(StopReason::MissingTarget));
    }
}
