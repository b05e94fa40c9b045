//! Sliding-window limiter on agent invocations.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    /// `max_calls` of zero disables limiting.
    pub fn new(max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant) {
        if self.max_calls == 0 {
            return;
        }
        self.prune(now);
        self.calls.push_back(now);
    }

    /// Minimum wait before another call fits in the window, if the window is full.
    pub fn min_wait(&mut self, now: Instant) -> Option<Duration> {
        if self.max_calls == 0 {
            return None;
        }
        self.prune(now);
        if (self.calls.len() as u32) < self.max_calls {
            return None;
        }
        let oldest = *self.calls.front()?;
        let wait = self
            .window
            .saturating_sub(now.saturating_duration_since(oldest));
        Some(wait.max(Duration::from_millis(1)))
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_never_waits() {
        let mut limiter = RateLimiter::new(0, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..100 {
            limiter.record(now);
        }
        assert_eq!(limiter.min_wait(now), None);
    }

    #[test]
    fn full_window_reports_wait_until_oldest_expires() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.record(start);
        assert_eq!(limiter.min_wait(start), None);
        limiter.record(start + Duration::from_secs(10));

        let now = start + Duration::from_secs(20);
        assert_eq!(limiter.min_wait(now), Some(Duration::from_secs(40)));
        assert_eq!(limiter.min_wait(start + Duration::from_secs(60)), None);
    }
}
