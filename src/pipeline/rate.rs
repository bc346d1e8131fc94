//! Emission gating and failure counting for stage loops

use std::time::{Duration, Instant};

/// Minimum-interval gate. Only remembers when it last let something through.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    period: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// True once `period` has elapsed since the last emission (always true before the first).
    pub fn is_ready(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.period,
            None => true,
        }
    }

    /// Record an emission at `now`.
    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    /// Check and record in one step.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.is_ready(now) {
            self.mark(now);
            true
        } else {
            false
        }
    }

    /// Time left until the gate opens again.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self.period.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

/// Consecutive-failure counter that trips once the count exceeds `threshold`.
#[derive(Debug, Clone)]
pub struct FailureCounter {
    count: u32,
    threshold: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    /// Count one failure; returns true when the threshold has been exceeded.
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count > self.threshold
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
