//! The closed catalog of maintenance operations and the action contract.
//!
//! Operation types are a fixed enum, not free-form strings, so a typo in a
//! config file or CLI argument fails at parse time instead of silently
//! creating a new ledger bucket.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A category of automated maintenance fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    /// Repair obviously broken syntax (missing commas, unbalanced braces).
    SyntaxFix,
    /// Add missing imports, drop references to files that no longer exist.
    ImportCleanup,
    /// Lint auto-fix.
    LintFix,
    /// Formatter pass.
    FormatFix,
    /// Remove dead code flagged by the toolchain.
    DeadCodeSweep,
    /// Deduplicate redundant source entries.
    DuplicateCleanup,
}

impl OperationType {
    /// Full catalog, in the order cycles evaluate it.
    pub fn all() -> [OperationType; 6] {
        [
            OperationType::SyntaxFix,
            OperationType::ImportCleanup,
            OperationType::LintFix,
            OperationType::FormatFix,
            OperationType::DeadCodeSweep,
            OperationType::DuplicateCleanup,
        ]
    }

    /// Stable identifier used in persisted state and on the CLI.
    pub fn key(&self) -> &'static str {
        match self {
            OperationType::SyntaxFix => "syntax-fix",
            OperationType::ImportCleanup => "import-cleanup",
            OperationType::LintFix => "lint-fix",
            OperationType::FormatFix => "format-fix",
            OperationType::DeadCodeSweep => "dead-code-sweep",
            OperationType::DuplicateCleanup => "duplicate-cleanup",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationType::SyntaxFix => "Syntax repair",
            OperationType::ImportCleanup => "Import cleanup",
            OperationType::LintFix => "Lint auto-fix",
            OperationType::FormatFix => "Format pass",
            OperationType::DeadCodeSweep => "Dead code sweep",
            OperationType::DuplicateCleanup => "Duplicate cleanup",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            OperationType::SyntaxFix | OperationType::ImportCleanup => Category::Correctness,
            OperationType::LintFix | OperationType::FormatFix => Category::Style,
            OperationType::DeadCodeSweep | OperationType::DuplicateCleanup => Category::Hygiene,
        }
    }

    /// Cheap-to-reverify correctness operations run every cycle regardless of
    /// change state or history.
    pub fn is_always_critical(&self) -> bool {
        matches!(self, OperationType::SyntaxFix)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for OperationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        OperationType::all()
            .into_iter()
            .find(|op| op.key() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown operation type: {}", s))
    }
}

/// Round-robin grouping the scheduler rotates through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Correctness,
    Style,
    Hygiene,
}

impl Category {
    pub fn all() -> [Category; 3] {
        [Category::Correctness, Category::Style, Category::Hygiene]
    }

    pub fn key(&self) -> &'static str {
        match self {
            Category::Correctness => "correctness",
            Category::Style => "style",
            Category::Hygiene => "hygiene",
        }
    }

    pub fn operations(&self) -> Vec<OperationType> {
        OperationType::all()
            .into_iter()
            .filter(|op| op.category() == *self)
            .collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Category::all()
            .into_iter()
            .find(|c| c.key() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown category: {}", s))
    }
}

/// What an action reports back after mutating the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub items_affected: u32,
    #[serde(default)]
    pub note: Option<String>,
}

impl ActionOutcome {
    pub fn failure(note: impl Into<String>) -> Self {
        Self {
            success: false,
            items_affected: 0,
            note: Some(note.into()),
        }
    }
}

/// The contract between the gate and the mutation it guards. The gate knows
/// nothing about how the fix works, only what it reports.
pub trait FixAction {
    fn invoke(&self, repo_root: &Path) -> Result<ActionOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_through_from_str() {
        for op in OperationType::all() {
            let parsed: OperationType = op.key().parse().unwrap();
            assert_eq!(parsed, op);
        }
        assert!("typo-fix".parse::<OperationType>().is_err());
    }

    #[test]
    fn categories_partition_the_catalog() {
        let mut seen = Vec::new();
        for category in Category::all() {
            for op in category.operations() {
                assert_eq!(op.category(), category);
                seen.push(op);
            }
        }
        assert_eq!(seen.len(), OperationType::all().len());
    }

    #[test]
    fn only_syntax_fix_is_always_critical() {
        let critical: Vec<_> = OperationType::all()
            .into_iter()
            .filter(|op| op.is_always_critical())
            .collect();
        assert_eq!(critical, vec![OperationType::SyntaxFix]);
    }

    #[test]
    fn serde_uses_kebab_case_keys() {
        let json = serde_json::to_string(&OperationType::SyntaxFix).unwrap();
        assert_eq!(json, "\"syntax-fix\"");
    }
}
