//! The run/skip decision for one operation type.
//!
//! Exploitation-only frequency gating: once an operation has three samples
//! and a success rate under the threshold, it stays suppressed until the
//! tracked tree changes. No re-exploration; a deliberate, documented
//! tradeoff inherited from the system this replaces.

use crate::ledger::AggregateStats;
use crate::ops::OperationType;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Why a decision came out the way it did. Every skip is explainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    /// Cheap-to-reverify correctness operation; runs every cycle.
    AlwaysCritical,
    /// The tracked tree drifted since the last accepted cycle.
    ChangeDetected,
    /// No attempts on record; first try is optimistic.
    NeverRun,
    /// Healthy operation, but it has been longer than the staleness interval.
    StaleInterval,
    /// Well-sampled and chronically failing; suppressed.
    LowSuccessRate,
    /// Stale and still under the sample floor; run while optimistic.
    InsufficientSamples,
    /// Ran recently and nothing changed.
    RecentlyRun,
    /// The safety gate vetoed the whole cycle.
    SafetyVeto,
}

impl DecisionReason {
    pub fn label(&self) -> &'static str {
        match self {
            DecisionReason::AlwaysCritical => "always-critical operation",
            DecisionReason::ChangeDetected => "tracked tree changed",
            DecisionReason::NeverRun => "never attempted",
            DecisionReason::StaleInterval => "staleness interval elapsed",
            DecisionReason::LowSuccessRate => "success rate below threshold",
            DecisionReason::InsufficientSamples => "too few samples to judge",
            DecisionReason::RecentlyRun => "ran recently, no change",
            DecisionReason::SafetyVeto => "vetoed by safety gate",
        }
    }
}

/// Transient result of consulting the policy. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunDecision {
    pub should_run: bool,
    pub reason: DecisionReason,
}

impl RunDecision {
    fn run(reason: DecisionReason) -> Self {
        Self {
            should_run: true,
            reason,
        }
    }

    fn skip(reason: DecisionReason) -> Self {
        Self {
            should_run: false,
            reason,
        }
    }
}

pub struct PolicyEngine {
    /// Attempts required before the success rate is trusted.
    pub min_samples: u64,
    /// Suppression threshold on the success rate.
    pub low_success_threshold: f64,
    /// How long a healthy operation may sit idle before re-running.
    pub stale_after: chrono::Duration,
}

impl PolicyEngine {
    pub fn new(min_samples: u64, low_success_threshold: f64, stale_after: chrono::Duration) -> Self {
        Self {
            min_samples,
            low_success_threshold,
            stale_after,
        }
    }

    /// Decide whether `operation` is worth running, in strict priority
    /// order. Safety vetoes are handled a level above; by the time this is
    /// consulted, the cycle is allowed to proceed.
    pub fn decide(
        &self,
        operation: OperationType,
        change_detected: bool,
        stats: &AggregateStats,
    ) -> RunDecision {
        if operation.is_always_critical() {
            return RunDecision::run(DecisionReason::AlwaysCritical);
        }
        if change_detected {
            return RunDecision::run(DecisionReason::ChangeDetected);
        }
        if stats.total_attempts == 0 {
            return RunDecision::run(DecisionReason::NeverRun);
        }
        if let Some(rate) = stats.success_rate(self.min_samples) {
            if rate < self.low_success_threshold {
                return RunDecision::skip(DecisionReason::LowSuccessRate);
            }
        }
        let is_stale = match stats.last_run_at {
            Some(last) => Utc::now().signed_duration_since(last) > self.stale_after,
            None => true,
        };
        if is_stale {
            // Under the sample floor the rate was never consulted; surface
            // that state instead of claiming ordinary staleness.
            let reason = if stats.total_attempts < self.min_samples {
                DecisionReason::InsufficientSamples
            } else {
                DecisionReason::StaleInterval
            };
            return RunDecision::run(reason);
        }
        RunDecision::skip(DecisionReason::RecentlyRun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn engine() -> PolicyEngine {
        PolicyEngine::new(3, 0.70, Duration::hours(1))
    }

    fn stats(attempts: u64, successes: u64, last_run_mins_ago: i64) -> AggregateStats {
        AggregateStats {
            total_attempts: attempts,
            success_count: successes,
            last_run_at: Some(Utc::now() - Duration::minutes(last_run_mins_ago)),
        }
    }

    #[test]
    fn always_critical_runs_without_change() {
        let decision = engine().decide(OperationType::SyntaxFix, false, &stats(10, 0, 1));
        assert!(decision.should_run);
        assert_eq!(decision.reason, DecisionReason::AlwaysCritical);
    }

    #[test]
    fn change_beats_low_success_rate() {
        let decision = engine().decide(OperationType::LintFix, true, &stats(10, 0, 1));
        assert!(decision.should_run);
        assert_eq!(decision.reason, DecisionReason::ChangeDetected);
    }

    #[test]
    fn never_run_is_optimistic() {
        let decision = engine().decide(OperationType::LintFix, false, &AggregateStats::default());
        assert!(decision.should_run);
        assert_eq!(decision.reason, DecisionReason::NeverRun);
    }

    #[test]
    fn three_failures_flip_to_suppressed() {
        let decision = engine().decide(OperationType::LintFix, false, &stats(3, 0, 0));
        assert!(!decision.should_run);
        assert_eq!(decision.reason, DecisionReason::LowSuccessRate);
    }

    #[test]
    fn suppression_lifts_when_rate_recovers() {
        // 7/10 is exactly the threshold; not below it, so not suppressed.
        let decision = engine().decide(OperationType::LintFix, false, &stats(10, 7, 120));
        assert!(decision.should_run);
        assert_eq!(decision.reason, DecisionReason::StaleInterval);
    }

    #[test]
    fn healthy_and_recent_skips() {
        let decision = engine().decide(OperationType::FormatFix, false, &stats(5, 5, 10));
        assert!(!decision.should_run);
        assert_eq!(decision.reason, DecisionReason::RecentlyRun);
    }

    #[test]
    fn healthy_and_stale_runs() {
        let decision = engine().decide(OperationType::FormatFix, false, &stats(5, 5, 90));
        assert!(decision.should_run);
        assert_eq!(decision.reason, DecisionReason::StaleInterval);
    }

    #[test]
    fn under_sampled_stale_runs_as_insufficient_samples() {
        // Two failures on record: the rate is not consulted yet.
        let decision = engine().decide(OperationType::FormatFix, false, &stats(2, 0, 90));
        assert!(decision.should_run);
        assert_eq!(decision.reason, DecisionReason::InsufficientSamples);
    }

    #[test]
    fn under_sampled_recent_skips() {
        let decision = engine().decide(OperationType::FormatFix, false, &stats(2, 0, 5));
        assert!(!decision.should_run);
        assert_eq!(decision.reason, DecisionReason::RecentlyRun);
    }
}
