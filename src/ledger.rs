//! The outcome ledger: what ran, when, and how it went.
//!
//! Recent history is bounded to a window per operation type so the file
//! never grows without limit. Lifetime attempt/success counters are stored
//! alongside the window, not derived from it, so trimming old records never
//! erases long-run accuracy.

use crate::ops::OperationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Most recent records kept per operation type.
pub const HISTORY_WINDOW: usize = 100;

/// One completed (or failed) run of one operation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub operation: OperationType,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub items_affected: u32,
    #[serde(default)]
    pub note: Option<String>,
}

/// Per-operation slice of the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationHistory {
    /// Newest-last window of recent records.
    pub recent: Vec<RunRecord>,
    /// Lifetime counters, independent of the window.
    pub total_attempts: u64,
    pub success_count: u64,
}

/// Derived view over one operation's history.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateStats {
    pub total_attempts: u64,
    pub success_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl AggregateStats {
    /// `None` while there are too few samples to judge; callers treat that
    /// as "optimistic", not as zero.
    pub fn success_rate(&self, min_samples: u64) -> Option<f64> {
        if self.total_attempts < min_samples {
            return None;
        }
        Some(self.success_count as f64 / self.total_attempts as f64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    pub operations: HashMap<OperationType, OperationHistory>,
}

impl Ledger {
    /// Append one record: push into the window, trim the oldest past the
    /// bound, bump lifetime counters.
    pub fn append(&mut self, record: RunRecord) {
        let history = self.operations.entry(record.operation).or_default();
        history.total_attempts += 1;
        if record.success {
            history.success_count += 1;
        }
        history.recent.push(record);
        if history.recent.len() > HISTORY_WINDOW {
            let excess = history.recent.len() - HISTORY_WINDOW;
            history.recent.drain(0..excess);
        }
    }

    pub fn stats(&self, operation: OperationType) -> AggregateStats {
        match self.operations.get(&operation) {
            Some(history) => AggregateStats {
                total_attempts: history.total_attempts,
                success_count: history.success_count,
                last_run_at: history.recent.last().map(|r| r.timestamp),
            },
            None => AggregateStats::default(),
        }
    }

    pub fn recent(&self, operation: OperationType) -> &[RunRecord] {
        self.operations
            .get(&operation)
            .map(|h| h.recent.as_slice())
            .unwrap_or(&[])
    }
}
