//! One cycle of the gate, end to end.
//!
//! INIT -> SAFETY_CHECK -> {VETOED | PROCEED}; on PROCEED every operation in
//! scope goes CONSULT_POLICY -> {SKIP | RUN}; on RUN -> INVOKE_ACTION ->
//! RECORD_OUTCOME, then on to the next type no matter how this one went.
//! One failing action never blocks evaluation of its siblings.
//!
//! All per-cycle state lives in an explicit context owned here for the
//! duration of the cycle; components receive what they need as arguments.

use crate::action::ActionSet;
use crate::config::Config;
use crate::fingerprint::{ChangeDetector, SourceSnapshot};
use crate::ledger::RunRecord;
use crate::ops::{ActionOutcome, Category, OperationType};
use crate::policy::{PolicyEngine, RunDecision};
use crate::safety::{SafetyGate, SafetyReport};
use crate::store::StateStore;
use crate::util::truncate;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

const NOTE_MAX_CHARS: usize = 400;

/// Context threaded through one cycle. Created at INIT, dropped at the end.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Restriction applied by the scheduler's round-robin, if any.
    pub category: Option<Category>,
    pub change_detected: bool,
}

/// What happened to one operation type this cycle.
#[derive(Debug)]
pub struct OperationReport {
    pub operation: OperationType,
    pub decision: RunDecision,
    /// Present only when the action was actually invoked.
    pub outcome: Option<ActionOutcome>,
}

#[derive(Debug)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub category: Option<Category>,
    pub safety: SafetyReport,
    pub operations: Vec<OperationReport>,
}

impl CycleReport {
    pub fn vetoed(&self) -> bool {
        self.safety.vetoed()
    }

    pub fn degraded(&self) -> bool {
        self.safety.degraded()
    }

    pub fn ran_count(&self) -> usize {
        self.operations.iter().filter(|o| o.outcome.is_some()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.operations.iter().filter(|o| o.outcome.is_none()).count()
    }

    /// True when at least one invoked action reported success.
    pub fn any_succeeded(&self) -> bool {
        self.operations
            .iter()
            .any(|o| o.outcome.as_ref().is_some_and(|out| out.success))
    }
}

pub struct Coordinator<'a> {
    root: &'a Path,
    config: &'a Config,
    store: &'a StateStore,
    policy: PolicyEngine,
    gate: SafetyGate,
    actions: ActionSet,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        root: &'a Path,
        config: &'a Config,
        store: &'a StateStore,
        gate: SafetyGate,
        actions: ActionSet,
    ) -> Self {
        let policy = PolicyEngine::new(
            config.min_samples,
            config.low_success_threshold,
            config.stale_after(),
        );
        Self {
            root,
            config,
            store,
            policy,
            gate,
            actions,
        }
    }

    /// Run one cycle, optionally restricted to a category.
    pub fn run_cycle(&self, category: Option<Category>) -> Result<CycleReport> {
        let detector = ChangeDetector::new(self.root, self.config);
        let current_fingerprint = detector.compute_fingerprint()?;
        let stored = self.store.load_snapshot();
        let change_detected = match &stored {
            Some(snapshot) => snapshot.fingerprint != current_fingerprint,
            None => true,
        };

        let ctx = CycleContext {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            category,
            change_detected,
        };
        info!(
            cycle = %ctx.cycle_id,
            category = ctx.category.map(|c| c.key()).unwrap_or("all"),
            change_detected,
            "cycle started"
        );

        let safety = self.gate.evaluate(self.root);
        if safety.vetoed() {
            // A veto terminates the cycle before any operation is consulted
            // and leaves every persisted structure untouched.
            warn!(cycle = %ctx.cycle_id, score = safety.score, "cycle vetoed by safety gate");
            return Ok(CycleReport {
                cycle_id: ctx.cycle_id,
                category: ctx.category,
                safety,
                operations: Vec::new(),
            });
        }
        if safety.degraded() {
            warn!(cycle = %ctx.cycle_id, score = safety.score, "cycle proceeding degraded");
        }

        let in_scope: Vec<OperationType> = match ctx.category {
            Some(category) => category.operations(),
            None => OperationType::all().to_vec(),
        };

        let mut ledger = self.store.load_ledger();
        let mut operations = Vec::with_capacity(in_scope.len());
        let mut ran_any = false;

        for operation in in_scope {
            let stats = ledger.stats(operation);
            let decision = self.policy.decide(operation, ctx.change_detected, &stats);
            if !decision.should_run {
                info!(
                    cycle = %ctx.cycle_id,
                    op = operation.key(),
                    reason = decision.reason.label(),
                    "skipped"
                );
                operations.push(OperationReport {
                    operation,
                    decision,
                    outcome: None,
                });
                continue;
            }

            let outcome = self.invoke(operation);
            let record = RunRecord {
                operation,
                timestamp: Utc::now(),
                success: outcome.success,
                items_affected: outcome.items_affected,
                note: outcome.note.clone(),
            };
            ledger.append(record);
            self.store.save_ledger(&ledger)?;
            ran_any = true;

            info!(
                cycle = %ctx.cycle_id,
                op = operation.key(),
                success = outcome.success,
                items = outcome.items_affected,
                "recorded outcome"
            );
            operations.push(OperationReport {
                operation,
                decision,
                outcome: Some(outcome),
            });
        }

        // Inspection alone must not advance drift state; only a cycle that
        // actually ran something accepts the new fingerprint.
        if ran_any {
            self.store
                .save_snapshot(&SourceSnapshot::new(current_fingerprint))?;
        }

        Ok(CycleReport {
            cycle_id: ctx.cycle_id,
            category: ctx.category,
            safety,
            operations,
        })
    }

    /// Invoke the action for one operation, absorbing every way it can go
    /// wrong into an outcome. Panics become `exception` notes.
    fn invoke(&self, operation: OperationType) -> ActionOutcome {
        let Some(action) = self.actions.get(operation) else {
            return ActionOutcome::failure("no action configured for this operation");
        };

        let invoked = catch_unwind(AssertUnwindSafe(|| action.invoke(self.root)));
        match invoked {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => ActionOutcome::failure(truncate(&format!("error: {:#}", err), NOTE_MAX_CHARS)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<String>()
                    .map(|s| s.as_str())
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                ActionOutcome::failure(truncate(&format!("exception: {}", message), NOTE_MAX_CHARS))
            }
        }
    }

    /// Answer "would this run right now?" without running anything and
    /// without consulting the safety gate. Read-only.
    pub fn preview(&self, operation: OperationType) -> Result<RunDecision> {
        let detector = ChangeDetector::new(self.root, self.config);
        let change_detected = detector.has_changed(self.store.load_snapshot().as_ref())?;
        let ledger = self.store.load_ledger();
        Ok(self
            .policy
            .decide(operation, change_detected, &ledger.stats(operation)))
    }

    /// Record an externally obtained result, e.g. an operator running a fix
    /// by hand and reporting back.
    pub fn record_external(
        &self,
        operation: OperationType,
        success: bool,
        items_affected: u32,
        note: Option<String>,
    ) -> Result<()> {
        let mut ledger = self.store.load_ledger();
        ledger.append(RunRecord {
            operation,
            timestamp: Utc::now(),
            success,
            items_affected,
            note,
        });
        self.store.save_ledger(&ledger)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::FixAction;
    use crate::policy::DecisionReason;
    use crate::safety::{CheckResult, SafetyCheck};
    use tempfile::TempDir;

    struct Fixed {
        success: bool,
        items: u32,
    }

    impl FixAction for Fixed {
        fn invoke(&self, _repo_root: &Path) -> Result<ActionOutcome> {
            Ok(ActionOutcome {
                success: self.success,
                items_affected: self.items,
                note: None,
            })
        }
    }

    struct Panics;

    impl FixAction for Panics {
        fn invoke(&self, _repo_root: &Path) -> Result<ActionOutcome> {
            panic!("action blew up");
        }
    }

    fn permissive_gate() -> SafetyGate {
        SafetyGate::new(vec![SafetyCheck::new("ok", 1.0, |_| CheckResult::pass())])
    }

    fn veto_gate() -> SafetyGate {
        SafetyGate::new(vec![SafetyCheck::new("down", 1.0, |_| {
            CheckResult::fail("nope")
        })])
    }

    fn full_actions(success: bool) -> ActionSet {
        let mut actions = ActionSet::empty();
        for op in OperationType::all() {
            actions.insert(op, Box::new(Fixed { success, items: 3 }));
        }
        actions
    }

    #[test]
    fn first_cycle_runs_and_records() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("lib.rs"), "fn x() {}").unwrap();
        let config = Config::default();
        let store = StateStore::new(tmp.path());
        let coordinator =
            Coordinator::new(tmp.path(), &config, &store, permissive_gate(), full_actions(true));

        let report = coordinator.run_cycle(None).unwrap();
        assert!(!report.vetoed());
        assert_eq!(report.ran_count(), OperationType::all().len());

        let stats = store.load_ledger().stats(OperationType::SyntaxFix);
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.success_count, 1);
        assert!(store.load_snapshot().is_some());
    }

    #[test]
    fn vetoed_cycle_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let config = Config::default();
        let store = StateStore::new(tmp.path());
        let coordinator =
            Coordinator::new(tmp.path(), &config, &store, veto_gate(), full_actions(true));

        let report = coordinator.run_cycle(None).unwrap();
        assert!(report.vetoed());
        assert!(report.operations.is_empty());
        assert_eq!(store.load_ledger().operations.len(), 0);
        assert!(store.load_snapshot().is_none());
    }

    #[test]
    fn panicking_action_is_isolated_and_recorded() {
        let tmp = TempDir::new().unwrap();
        let config = Config::default();
        let store = StateStore::new(tmp.path());

        let mut actions = ActionSet::empty();
        actions.insert(OperationType::SyntaxFix, Box::new(Panics));
        actions.insert(OperationType::ImportCleanup, Box::new(Fixed { success: true, items: 1 }));
        let coordinator =
            Coordinator::new(tmp.path(), &config, &store, permissive_gate(), actions);

        let report = coordinator
            .run_cycle(Some(Category::Correctness))
            .unwrap();
        assert_eq!(report.ran_count(), 2);

        let ledger = store.load_ledger();
        let syntax = ledger.recent(OperationType::SyntaxFix);
        assert!(!syntax[0].success);
        assert!(syntax[0].note.as_deref().unwrap().starts_with("exception:"));
        // The sibling still ran and succeeded.
        assert!(ledger.recent(OperationType::ImportCleanup)[0].success);
    }

    #[test]
    fn snapshot_only_advances_when_something_ran() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("app.py"), "x = 1").unwrap();
        let config = Config::default();
        let store = StateStore::new(tmp.path());

        // Seed a matching snapshot and fresh, healthy history for the style
        // operations so the whole category decides RecentlyRun.
        let detector = ChangeDetector::new(tmp.path(), &config);
        store
            .save_snapshot(&SourceSnapshot::new(detector.compute_fingerprint().unwrap()))
            .unwrap();
        let coordinator = Coordinator::new(
            tmp.path(),
            &config,
            &store,
            permissive_gate(),
            full_actions(true),
        );
        for op in Category::Style.operations() {
            for _ in 0..3 {
                coordinator.record_external(op, true, 0, None).unwrap();
            }
        }
        let before = store.load_snapshot().unwrap();

        let report = coordinator.run_cycle(Some(Category::Style)).unwrap();
        assert_eq!(report.ran_count(), 0);
        assert_eq!(report.skipped_count(), 2);

        let after = store.load_snapshot().unwrap();
        assert_eq!(before.computed_at, after.computed_at);
    }

    #[test]
    fn unconfigured_operation_records_a_failure() {
        let tmp = TempDir::new().unwrap();
        let config = Config::default();
        let store = StateStore::new(tmp.path());
        let coordinator = Coordinator::new(
            tmp.path(),
            &config,
            &store,
            permissive_gate(),
            ActionSet::empty(),
        );

        coordinator.run_cycle(Some(Category::Hygiene)).unwrap();
        let ledger = store.load_ledger();
        let records = ledger.recent(OperationType::DeadCodeSweep);
        assert!(!records[0].success);
        assert!(records[0].note.as_deref().unwrap().contains("no action"));
    }

    #[test]
    fn three_external_failures_suppress_until_tree_changes() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("mod.rs"), "fn f() {}").unwrap();
        let config = Config::default();
        let store = StateStore::new(tmp.path());
        let coordinator = Coordinator::new(
            tmp.path(),
            &config,
            &store,
            permissive_gate(),
            full_actions(false),
        );

        let detector = ChangeDetector::new(tmp.path(), &config);
        store
            .save_snapshot(&SourceSnapshot::new(detector.compute_fingerprint().unwrap()))
            .unwrap();
        for _ in 0..3 {
            coordinator
                .record_external(OperationType::LintFix, false, 0, None)
                .unwrap();
        }

        let decision = coordinator.preview(OperationType::LintFix).unwrap();
        assert!(!decision.should_run);
        assert_eq!(decision.reason, DecisionReason::LowSuccessRate);

        // Drift lifts the suppression.
        std::fs::write(tmp.path().join("mod.rs"), "fn f() { let _ = 1; }").unwrap();
        let decision = coordinator.preview(OperationType::LintFix).unwrap();
        assert!(decision.should_run);
        assert_eq!(decision.reason, DecisionReason::ChangeDetected);
    }
}
