//! Termination policy of the repair loop.
//!
//! Decides, after each validated attempt, whether the session succeeds, tries
//! again, or stops. The identical-diagnostic streak bounds attempts wasted on a
//! candidate that keeps failing the same way.

use crate::core::types::{Diagnostic, Verdict};
use crate::error::ExhaustionReason;

/// Next step after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Succeed,
    Retry,
    Exhausted(ExhaustionReason),
}

/// Per-session convergence state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convergence {
    max_attempts: u32,
    identical_limit: u32,
    streak: u32,
    previous: Option<Diagnostic>,
}

impl Convergence {
    /// `identical_limit` of `0` disables the streak check.
    pub fn new(max_attempts: u32, identical_limit: u32) -> Self {
        Self {
            max_attempts,
            identical_limit,
            streak: 0,
            previous: None,
        }
    }

    /// Number of consecutive repeats of the latest diagnostic.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Record the verdict of attempt number `attempts_made` (1-based count)
    /// and decide what happens next.
    pub fn observe(&mut self, attempts_made: u32, verdict: &Verdict) -> Transition {
        let Some(diagnostic) = verdict.diagnostic.as_ref().filter(|_| !verdict.passed) else {
            return Transition::Succeed;
        };

        if self.previous.as_ref() == Some(diagnostic) {
            self.streak += 1;
        } else {
            self.streak = 0;
            self.previous = Some(diagnostic.clone());
        }

        if attempts_made >= self.max_attempts {
            return Transition::Exhausted(ExhaustionReason::MaxAttempts);
        }
        if self.identical_limit > 0 && self.streak >= self.identical_limit {
            return Transition::Exhausted(ExhaustionReason::RepeatedDiagnostic {
                repeats: self.streak,
            });
        }
        Transition::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(summary: &str) -> Verdict {
        Verdict::fail(Diagnostic {
            summary: summary.to_string(),
            failing_assertions: vec!["x".to_string()],
            raw_output: String::new(),
        })
    }

    #[test]
    fn pass_succeeds_immediately() {
        let mut c = Convergence::new(3, 2);
        assert_eq!(c.observe(1, &Verdict::pass()), Transition::Succeed);
    }

    #[test]
    fn max_attempts_exhausts() {
        let mut c = Convergence::new(3, 0);
        assert_eq!(c.observe(1, &failing("a")), Transition::Retry);
        assert_eq!(c.observe(2, &failing("a")), Transition::Retry);
        assert_eq!(
            c.observe(3, &failing("a")),
            Transition::Exhausted(ExhaustionReason::MaxAttempts)
        );
    }

    #[test]
    fn identical_streak_stops_early() {
        let mut c = Convergence::new(10, 2);
        assert_eq!(c.observe(1, &failing("same")), Transition::Retry);
        assert_eq!(c.observe(2, &failing("same")), Transition::Retry);
        assert_eq!(c.streak(), 1);
        assert_eq!(
            c.observe(3, &failing("same")),
            Transition::Exhausted(ExhaustionReason::RepeatedDiagnostic { repeats: 2 })
        );
    }

    #[test]
    fn different_diagnostic_resets_streak() {
        let mut c = Convergence::new(10, 2);
        c.observe(1, &failing("a"));
        c.observe(2, &failing("a"));
        assert_eq!(c.observe(3, &failing("b")), Transition::Retry);
        assert_eq!(c.streak(), 0);
        assert_eq!(c.observe(4, &failing("b")), Transition::Retry);
    }

    #[test]
    fn max_attempts_wins_over_streak() {
        let mut c = Convergence::new(2, 1);
        c.observe(1, &failing("a"));
        assert_eq!(
            c.observe(2, &failing("a")),
            Transition::Exhausted(ExhaustionReason::MaxAttempts)
        );
    }
}
