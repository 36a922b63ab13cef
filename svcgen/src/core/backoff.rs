//! Retry timing for transient oracle failures.

use std::time::Duration;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first call; `0` means a single call.
    pub retries: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Upper bound of the delay before retry `retry` (0-based):
    /// `min(base * 2^retry, max)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Actual sleep before retry `retry`.
    ///
    /// `unit` is a uniform sample from `[0, 1]` supplied by the caller so this
    /// stays deterministic; with jitter the delay lands in `[delay/2, delay]`.
    /// A server `retry_after` hint is a lower bound.
    pub fn sleep_for(&self, retry: u32, retry_after: Option<Duration>, unit: f64) -> Duration {
        let delay = self.delay(retry);
        let delay = if self.jitter {
            let half = delay / 2;
            half + (delay - half).mul_f64(unit.clamp(0.0, 1.0))
        } else {
            delay
        };
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}
