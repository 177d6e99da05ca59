//! Provisioning orchestration.
//!
//! The orchestrator walks the step registry in dependency order and, for each
//! step, decides from live state whether work is needed:
//! - satisfied steps are skipped (and recorded if they were not yet),
//! - unsatisfied steps are applied and recorded only after apply returns,
//! - the first failed apply stops the run with earlier records intact.
//!
//! A step is satisfied when its live precondition holds and its recorded
//! content hash, if any, equals its current fingerprint.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{HubError, HubResult};
use crate::state::{SetupState, StateStore};
use crate::step::{Step, StepRegistry};
use crate::ui;

/// What happened to a step during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Live state already matched; nothing applied.
    Verified,
    /// Applied for the first time (or after a content change).
    Applied,
    /// Recorded as complete but live state had drifted; re-applied.
    DriftCorrected,
    /// Apply failed; the run stopped here.
    Failed,
    /// Not attempted because an earlier step failed.
    NotAttempted,
}

impl StepOutcome {
    #[must_use]
    pub fn applied(self) -> bool {
        matches!(self, Self::Applied | Self::DriftCorrected)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => write!(f, "verified"),
            Self::Applied => write!(f, "applied"),
            Self::DriftCorrected => write!(f, "drift corrected"),
            Self::Failed => write!(f, "failed"),
            Self::NotAttempted => write!(f, "not attempted"),
        }
    }
}

/// Per-step line of a [`RunReport`].
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: String,
    pub description: String,
    pub outcome: StepOutcome,
}

/// Result of one orchestrator run.
#[derive(Debug)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    /// State after the run; identical to what is on disk.
    pub state: SetupState,
    /// The error that halted the run, if any.
    pub failure: Option<HubError>,
}

impl RunReport {
    /// Ids of steps whose apply ran, in execution order.
    #[must_use]
    pub fn applied(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.outcome.applied())
            .map(|s| s.id.as_str())
            .collect()
    }

    #[must_use]
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }

    #[must_use]
    pub fn outcome_of(&self, id: &str) -> Option<StepOutcome> {
        self.steps.iter().find(|s| s.id == id).map(|s| s.outcome)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Turn a halted run into its error.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the run.
    pub fn into_result(mut self) -> HubResult<Self> {
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Executes a step registry against a context, persisting progress.
pub struct Orchestrator {
    store: StateStore,
}

impl Orchestrator {
    #[must_use]
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Load state from the store and run.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run`]; also fails if the state file is unreadable.
    pub fn run_from_store<C: ?Sized>(
        &self,
        registry: &StepRegistry<C>,
        ctx: &C,
    ) -> HubResult<RunReport> {
        let state = self.store.load()?;
        self.run(registry, ctx, state)
    }

    /// Run every pending step in dependency order.
    ///
    /// Step failures do not return `Err`; they end the run and are carried in
    /// [`RunReport::failure`] together with the state reached so far.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::DependencyCycle`] or [`HubError::Config`] if the
    /// registry cannot be ordered. No step is attempted in that case.
    pub fn run<C: ?Sized>(
        &self,
        registry: &StepRegistry<C>,
        ctx: &C,
        mut state: SetupState,
    ) -> HubResult<RunReport> {
        let order = registry.resolve_order()?;
        let total = order.len();
        info!(steps = total, recorded = state.len(), "Starting provisioning run");

        let mut reports = Vec::with_capacity(total);
        let mut completed: BTreeSet<String> = BTreeSet::new();
        let mut failure: Option<HubError> = None;

        for (index, step) in order.into_iter().enumerate() {
            let id = step.id().to_string();

            let blocked = failure.is_some()
                || !step.dependencies().iter().all(|d| completed.contains(d));
            if blocked {
                debug!(step = %id, "Dependencies incomplete, not attempting");
                reports.push(Self::report(step, StepOutcome::NotAttempted));
                continue;
            }

            ui::print_progress_step(index + 1, total, step.description());

            match self.execute_step(step, ctx, &mut state) {
                Ok(outcome) => {
                    completed.insert(id);
                    reports.push(Self::report(step, outcome));
                }
                Err(e) => {
                    error!(step = %id, error = %e, "Step failed, stopping run");
                    reports.push(Self::report(step, StepOutcome::Failed));
                    failure = Some(e);
                }
            }
        }

        let report = RunReport {
            steps: reports,
            state,
            failure,
        };
        info!(
            applied = report.applied().len(),
            verified = report.count(StepOutcome::Verified),
            failed = !report.is_success(),
            "Provisioning run finished"
        );
        Ok(report)
    }

    fn execute_step<C: ?Sized>(
        &self,
        step: &dyn Step<C>,
        ctx: &C,
        state: &mut SetupState,
    ) -> HubResult<StepOutcome> {
        let id = step.id();

        let fingerprint = step.fingerprint(ctx).map_err(|source| HubError::StepApply {
            step: id.to_string(),
            source: source.context("cannot compute desired content"),
        })?;

        let live = match step.check(ctx) {
            Ok(live) => live,
            Err(source) => {
                let err = HubError::PreconditionCheck {
                    step: id.to_string(),
                    source,
                };
                warn!(step = %id, error = %err, "Treating step as unsatisfied");
                false
            }
        };

        let recorded_hash = state.get(id).map(|r| r.content_hash.clone());
        let hash_current = recorded_hash.as_ref().map_or(true, |h| *h == fingerprint);

        if live && hash_current {
            if recorded_hash.is_none() {
                state.record(id, fingerprint);
                self.store.save(state)?;
            }
            debug!(step = %id, "Already satisfied");
            ui::print_progress(&format!("{} (already satisfied)", step.description()));
            return Ok(StepOutcome::Verified);
        }

        let outcome = match (recorded_hash.is_some(), live) {
            (true, false) => {
                warn!(step = %id, "Recorded as complete but live state drifted, re-applying");
                StepOutcome::DriftCorrected
            }
            (true, true) => {
                info!(step = %id, "Desired content changed, re-applying");
                StepOutcome::Applied
            }
            (false, _) => {
                info!(step = %id, "Applying");
                StepOutcome::Applied
            }
        };

        step.apply(ctx).map_err(|source| HubError::StepApply {
            step: id.to_string(),
            source,
        })?;

        state.record(id, fingerprint);
        self.store.save(state)?;
        ui::print_success(&format!("{} ({outcome})", step.description()));
        Ok(outcome)
    }

    fn report<C: ?Sized>(step: &dyn Step<C>, outcome: StepOutcome) -> StepReport {
        StepReport {
            id: step.id().to_string(),
            description: step.description().to_string(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    use tempfile::TempDir;

    use super::*;
    use crate::step::FnStep;

    #[derive(Default)]
    struct World {
        live: RefCell<BTreeSet<&'static str>>,
        applies: RefCell<Vec<&'static str>>,
    }

    fn step(id: &'static str) -> FnStep<World> {
        FnStep::new(
            id,
            format!("step {id}"),
            move |w: &World| Ok(w.live.borrow().contains(id)),
            move |w: &World| {
                w.applies.borrow_mut().push(id);
                w.live.borrow_mut().insert(id);
                Ok(())
            },
        )
    }

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        Orchestrator::new(StateStore::new(dir.path().join("state.json")))
    }

    #[test]
    fn test_records_verified_step_without_applying() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let mut registry = StepRegistry::new();
        registry.register(step("a"));

        let world = World::default();
        world.live.borrow_mut().insert("a");

        let report = orch.run(&registry, &world, SetupState::new()).unwrap();
        assert_eq!(report.outcome_of("a"), Some(StepOutcome::Verified));
        assert!(world.applies.borrow().is_empty());
        assert!(report.state.is_recorded("a"));
        assert!(orch.store().load().unwrap().is_recorded("a"));
    }

    #[test]
    fn test_precondition_error_means_apply() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let mut registry: StepRegistry<World> = StepRegistry::new();
        registry.register(FnStep::new(
            "probe",
            "flaky probe",
            |_: &World| anyhow::bail!("systemctl not reachable"),
            |w: &World| {
                w.applies.borrow_mut().push("probe");
                Ok(())
            },
        ));

        let world = World::default();
        let report = orch.run(&registry, &world, SetupState::new()).unwrap();
        assert_eq!(report.outcome_of("probe"), Some(StepOutcome::Applied));
        assert_eq!(*world.applies.borrow(), vec!["probe"]);
    }

    #[test]
    fn test_fingerprint_change_reapplies() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let version = std::rc::Rc::new(RefCell::new("v1".to_string()));

        let build = |v: std::rc::Rc<RefCell<String>>| {
            let mut registry = StepRegistry::new();
            registry.register(
                step("conf").with_fingerprint(move |_| Ok(v.borrow().clone())),
            );
            registry
        };

        let world = World::default();
        let first = orch
            .run(&build(version.clone()), &world, SetupState::new())
            .unwrap();
        assert_eq!(first.applied(), vec!["conf"]);

        let second = orch
            .run(&build(version.clone()), &world, first.state.clone())
            .unwrap();
        assert!(second.applied().is_empty());

        *version.borrow_mut() = "v2".into();
        let third = orch.run(&build(version), &world, second.state).unwrap();
        assert_eq!(third.outcome_of("conf"), Some(StepOutcome::Applied));
        assert_eq!(third.state.get("conf").unwrap().content_hash, "v2");
    }

    #[test]
    fn test_cycle_attempts_nothing() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let mut registry = StepRegistry::new();
        registry
            .register(step("a").after("b"))
            .register(step("b").after("a"))
            .register(step("c"));

        let world = World::default();
        let err = orch.run(&registry, &world, SetupState::new()).unwrap_err();
        assert!(matches!(err, HubError::DependencyCycle { .. }));
        assert!(world.applies.borrow().is_empty());
        assert!(!dir.path().join("state.json").exists());
    }

    #[test]
    fn test_into_result_surfaces_failure() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let mut registry: StepRegistry<World> = StepRegistry::new();
        registry.register(FnStep::new(
            "boom",
            "always fails",
            |_: &World| Ok(false),
            |_: &World| anyhow::bail!("disk full"),
        ));

        let report = orch
            .run(&registry, &World::default(), SetupState::new())
            .unwrap();
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, HubError::StepApply { ref step, .. } if step == "boom"));
    }
}
