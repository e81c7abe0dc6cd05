//! Safety preconditions that can veto a whole cycle.
//!
//! A battery of named, weighted checks runs before any operation is even
//! considered. The weighted fraction that passes maps to a verdict:
//!
//! - `>= 0.8` proceed
//! - `>= 0.6` proceed, but the cycle is flagged degraded for audit
//! - `[0.4, 0.6)` attempt exactly one bounded repair, re-score once,
//!   then finalize (still under 0.6 means veto)
//! - `< 0.4` hard veto, no operation may run
//!
//! A veto is a property of the cycle, not of any operation's history: a
//! vetoed cycle records nothing in the ledger.

use crate::action::run_with_timeout;
use crate::config::Config;
use crate::project::{self, ProjectType};
use crate::store::StateStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const PROCEED_SCORE: f64 = 0.8;
const DEGRADED_SCORE: f64 = 0.6;
const VETO_SCORE: f64 = 0.4;
const BUILD_CHECK_TIMEOUT_SECS: u64 = 120;

/// Result of one predicate.
pub struct CheckResult {
    pub passed: bool,
    pub detail: Option<String>,
}

impl CheckResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            detail: None,
        }
    }

    pub fn pass_with(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: Some(detail.into()),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// A named precondition with a weight in (0, 1].
pub struct SafetyCheck {
    pub name: &'static str,
    pub weight: f64,
    check: Box<dyn Fn(&Path) -> CheckResult>,
}

impl SafetyCheck {
    pub fn new(
        name: &'static str,
        weight: f64,
        check: impl Fn(&Path) -> CheckResult + 'static,
    ) -> Self {
        debug_assert!(weight > 0.0 && weight <= 1.0);
        Self {
            name,
            weight,
            check: Box::new(check),
        }
    }
}

/// One check's contribution to a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub weight: f64,
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyVerdict {
    Proceed,
    Degraded,
    Veto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyReport {
    pub checks: Vec<CheckOutcome>,
    pub score: f64,
    pub verdict: SafetyVerdict,
    pub repair_attempted: bool,
}

impl SafetyReport {
    pub fn vetoed(&self) -> bool {
        self.verdict == SafetyVerdict::Veto
    }

    pub fn degraded(&self) -> bool {
        self.verdict == SafetyVerdict::Degraded
    }
}

type RepairFn = Box<dyn Fn(&Path) -> Result<String>>;

pub struct SafetyGate {
    checks: Vec<SafetyCheck>,
    repair: Option<RepairFn>,
}

impl SafetyGate {
    pub fn new(checks: Vec<SafetyCheck>) -> Self {
        Self {
            checks,
            repair: None,
        }
    }

    pub fn with_repair(mut self, repair: impl Fn(&Path) -> Result<String> + 'static) -> Self {
        self.repair = Some(Box::new(repair));
        self
    }

    /// The standard battery for a tracked tree.
    pub fn builtin(project: ProjectType, config: &Config) -> Self {
        let mut checks = Vec::new();

        if config.skip_build_check {
            checks.push(SafetyCheck::new("buildable", 1.0, |_| {
                CheckResult::pass_with("build check disabled by config")
            }));
        } else {
            checks.push(SafetyCheck::new("buildable", 1.0, move |root| {
                buildable_check(root, project)
            }));
        }

        checks.push(SafetyCheck::new("critical-files", 0.8, move |root| {
            critical_files_check(root, project)
        }));

        checks.push(SafetyCheck::new("worktree-intact", 0.6, worktree_check));

        Self::new(checks).with_repair(|root| {
            let removed = StateStore::new(root).sweep_orphaned_tmp()?;
            Ok(format!("removed {} orphaned temp file(s)", removed))
        })
    }

    /// Run the battery, applying the one-shot repair band.
    pub fn evaluate(&self, repo_root: &Path) -> SafetyReport {
        let (checks, score) = self.run_battery(repo_root);

        if (VETO_SCORE..DEGRADED_SCORE).contains(&score) {
            if let Some(repair) = &self.repair {
                match repair(repo_root) {
                    Ok(detail) => info!(score, %detail, "safety score marginal; attempted repair"),
                    Err(err) => warn!(score, error = %err, "safety repair failed"),
                }
                // One repair, one re-score. A result still under the
                // degraded floor finalizes as a veto.
                let (checks, score) = self.run_battery(repo_root);
                return SafetyReport {
                    checks,
                    score,
                    verdict: verdict_for(score),
                    repair_attempted: true,
                };
            }
        }

        SafetyReport {
            checks,
            score,
            verdict: verdict_for(score),
            repair_attempted: false,
        }
    }

    fn run_battery(&self, repo_root: &Path) -> (Vec<CheckOutcome>, f64) {
        let mut outcomes = Vec::with_capacity(self.checks.len());
        let mut total_weight = 0.0;
        let mut passed_weight = 0.0;

        for check in &self.checks {
            let result = (check.check)(repo_root);
            total_weight += check.weight;
            if result.passed {
                passed_weight += check.weight;
            }
            outcomes.push(CheckOutcome {
                name: check.name.to_string(),
                weight: check.weight,
                passed: result.passed,
                detail: result.detail,
            });
        }

        // An empty battery vetoes nothing.
        let score = if total_weight > 0.0 {
            passed_weight / total_weight
        } else {
            1.0
        };
        (outcomes, score)
    }
}

fn verdict_for(score: f64) -> SafetyVerdict {
    if score >= PROCEED_SCORE {
        SafetyVerdict::Proceed
    } else if score >= DEGRADED_SCORE {
        SafetyVerdict::Degraded
    } else {
        SafetyVerdict::Veto
    }
}

fn buildable_check(root: &Path, project: ProjectType) -> CheckResult {
    let Some((program, args)) = project::check_command(project) else {
        return CheckResult::pass_with(format!("no build check for {} project", project.name()));
    };
    let args: Vec<String> = args.into_iter().map(str::to_string).collect();
    match run_with_timeout(
        program,
        &args,
        root,
        Duration::from_secs(BUILD_CHECK_TIMEOUT_SECS),
    ) {
        Ok(run) if run.succeeded() => CheckResult::pass(),
        Ok(run) if run.timed_out => CheckResult::fail("build check timed out"),
        Ok(run) => CheckResult::fail(format!(
            "{} exited with {:?}",
            program,
            run.exit_code
        )),
        // A missing toolchain is a failed precondition, not a crash.
        Err(err) => CheckResult::fail(format!("could not run {}: {}", program, err)),
    }
}

fn critical_files_check(root: &Path, project: ProjectType) -> CheckResult {
    let files = project.critical_files();
    if files.is_empty() {
        return CheckResult::pass_with("no critical files for this project type");
    }
    for name in files {
        let path = root.join(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return CheckResult::fail(format!("{} missing or unreadable", name)),
        };
        let parseable = if name.ends_with(".toml") {
            content.parse::<toml::Value>().is_ok()
        } else if name.ends_with(".json") {
            serde_json::from_str::<serde_json::Value>(&content).is_ok()
        } else {
            !content.trim().is_empty()
        };
        if !parseable {
            return CheckResult::fail(format!("{} is not parseable", name));
        }
    }
    CheckResult::pass()
}

fn worktree_check(root: &Path) -> CheckResult {
    if fs::read_dir(root).is_err() {
        return CheckResult::fail("tree root is unreadable");
    }

    let git_head = root.join(".git").join("HEAD");
    if root.join(".git").is_dir() {
        match fs::read_to_string(&git_head) {
            Ok(content) if !content.trim().is_empty() => {}
            _ => return CheckResult::fail(".git/HEAD missing or empty"),
        }
    }

    let state_dir = root.join(crate::store::STATE_DIR);
    if state_dir.is_dir() {
        if let Ok(entries) = fs::read_dir(&state_dir) {
            for entry in entries.flatten() {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("tmp") {
                    return CheckResult::fail("orphaned temp files in state directory");
                }
            }
        }
    }
    CheckResult::pass()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn fixed(name: &'static str, weight: f64, passed: bool) -> SafetyCheck {
        SafetyCheck::new(name, weight, move |_| CheckResult {
            passed,
            detail: None,
        })
    }

    #[test]
    fn all_passing_proceeds() {
        let tmp = TempDir::new().unwrap();
        let gate = SafetyGate::new(vec![fixed("a", 1.0, true), fixed("b", 0.5, true)]);
        let report = gate.evaluate(tmp.path());
        assert_eq!(report.verdict, SafetyVerdict::Proceed);
        assert!((report.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn three_of_five_equal_checks_is_degraded() {
        let tmp = TempDir::new().unwrap();
        let gate = SafetyGate::new(vec![
            fixed("a", 1.0, true),
            fixed("b", 1.0, true),
            fixed("c", 1.0, true),
            fixed("d", 1.0, false),
            fixed("e", 1.0, false),
        ]);
        let report = gate.evaluate(tmp.path());
        assert!((report.score - 0.6).abs() < 1e-9);
        assert_eq!(report.verdict, SafetyVerdict::Degraded);
        assert!(!report.repair_attempted);
    }

    #[test]
    fn low_score_is_a_hard_veto() {
        let tmp = TempDir::new().unwrap();
        let gate = SafetyGate::new(vec![fixed("a", 1.0, false), fixed("b", 1.0, false)]);
        let report = gate.evaluate(tmp.path());
        assert_eq!(report.verdict, SafetyVerdict::Veto);
    }

    #[test]
    fn marginal_band_repairs_exactly_once() {
        let tmp = TempDir::new().unwrap();
        let repairs = Rc::new(Cell::new(0u32));
        let repairs_seen = repairs.clone();

        // Score 0.5: in the repair band.
        let gate = SafetyGate::new(vec![fixed("a", 1.0, true), fixed("b", 1.0, false)])
            .with_repair(move |_| {
                repairs_seen.set(repairs_seen.get() + 1);
                Ok("repaired".to_string())
            });

        let report = gate.evaluate(tmp.path());
        assert_eq!(repairs.get(), 1);
        assert!(report.repair_attempted);
        // Checks are fixed, so the re-score is unchanged and finalizes as veto.
        assert_eq!(report.verdict, SafetyVerdict::Veto);
    }

    #[test]
    fn repair_that_helps_lets_the_cycle_through() {
        let tmp = TempDir::new().unwrap();
        let healthy = Rc::new(Cell::new(false));
        let healthy_check = healthy.clone();
        let healthy_repair = healthy.clone();

        let flaky = SafetyCheck::new("flaky", 1.0, move |_| CheckResult {
            passed: healthy_check.get(),
            detail: None,
        });
        let gate = SafetyGate::new(vec![fixed("a", 1.0, true), flaky]).with_repair(move |_| {
            healthy_repair.set(true);
            Ok("fixed".to_string())
        });

        let report = gate.evaluate(tmp.path());
        assert!(report.repair_attempted);
        assert_eq!(report.verdict, SafetyVerdict::Proceed);
    }

    #[test]
    fn builtin_battery_flags_orphaned_tmp_files() {
        let tmp = TempDir::new().unwrap();
        let state_dir = tmp.path().join(crate::store::STATE_DIR);
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("ledger.tmp"), "x").unwrap();

        let result = worktree_check(tmp.path());
        assert!(!result.passed);
    }

    #[test]
    fn critical_files_check_rejects_unparseable_manifest() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Cargo.toml"), "[package\nbroken").unwrap();
        let result = critical_files_check(tmp.path(), ProjectType::Rust);
        assert!(!result.passed);

        std::fs::write(
            tmp.path().join("Cargo.toml"),
            "[package]\nname = \"x\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        assert!(critical_files_check(tmp.path(), ProjectType::Rust).passed);
    }
}
