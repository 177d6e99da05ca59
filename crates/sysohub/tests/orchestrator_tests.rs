//! End-to-end orchestrator behavior across repeated runs against a shared
//! state file.

use std::cell::RefCell;
use std::collections::BTreeSet;

use anyhow::bail;
use sysohub::{FnStep, HubError, Orchestrator, StateStore, StepOutcome, StepRegistry};
use tempfile::TempDir;

/// Simulated host: the set of effects currently in place.
#[derive(Default)]
struct World {
    effects: RefCell<BTreeSet<String>>,
    applies: RefCell<Vec<String>>,
    fail_on: RefCell<Option<String>>,
    content: RefCell<String>,
}

impl World {
    fn applies(&self) -> Vec<String> {
        self.applies.borrow().clone()
    }

    fn clear_log(&self) {
        self.applies.borrow_mut().clear();
    }
}

fn step(id: &'static str) -> FnStep<World> {
    FnStep::new(
        id,
        format!("Step {id}"),
        move |w: &World| Ok(w.effects.borrow().contains(id)),
        move |w: &World| {
            if w.fail_on.borrow().as_deref() == Some(id) {
                bail!("simulated failure in {id}");
            }
            w.effects.borrow_mut().insert(id.to_string());
            w.applies.borrow_mut().push(id.to_string());
            Ok(())
        },
    )
}

/// A -> B, A -> C.
fn registry() -> StepRegistry<World> {
    let mut registry = StepRegistry::new();
    registry
        .register(step("c").after("a"))
        .register(step("b").after("a"))
        .register(step("a"));
    registry
}

fn orchestrator(dir: &TempDir) -> Orchestrator {
    Orchestrator::new(StateStore::new(dir.path().join("state").join("setup-state.json")))
}

#[test]
fn test_second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let world = World::default();
    let registry = registry();

    let first = orchestrator(&dir)
        .run_from_store(&registry, &world)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(first.applied(), vec!["a", "b", "c"]);

    world.clear_log();
    let second = orchestrator(&dir)
        .run_from_store(&registry, &world)
        .unwrap()
        .into_result()
        .unwrap();
    assert!(second.applied().is_empty());
    assert_eq!(second.count(StepOutcome::Verified), 3);
    assert!(world.applies().is_empty());
}

#[test]
fn test_failed_run_resumes_from_failed_step() {
    let dir = TempDir::new().unwrap();
    let world = World::default();
    *world.fail_on.borrow_mut() = Some("b".into());
    let registry = registry();

    let report = orchestrator(&dir).run_from_store(&registry, &world).unwrap();
    assert!(!report.is_success());
    assert_eq!(report.outcome_of("a"), Some(StepOutcome::Applied));
    assert_eq!(report.outcome_of("b"), Some(StepOutcome::Failed));
    assert_eq!(report.outcome_of("c"), Some(StepOutcome::NotAttempted));
    assert!(matches!(
        report.into_result(),
        Err(HubError::StepApply { ref step, .. }) if step == "b"
    ));

    // Progress up to the failure is durable.
    let saved = StateStore::new(dir.path().join("state").join("setup-state.json"))
        .load()
        .unwrap();
    assert!(saved.is_recorded("a"));
    assert!(!saved.is_recorded("b"));

    *world.fail_on.borrow_mut() = None;
    world.clear_log();
    let resumed = orchestrator(&dir)
        .run_from_store(&registry, &world)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(world.applies(), vec!["b", "c"]);
    assert_eq!(resumed.outcome_of("a"), Some(StepOutcome::Verified));
}

#[test]
fn test_drift_reapplies_only_drifted_step() {
    let dir = TempDir::new().unwrap();
    let world = World::default();
    let registry = registry();
    orchestrator(&dir).run_from_store(&registry, &world).unwrap();

    world.effects.borrow_mut().remove("b");
    world.clear_log();

    let report = orchestrator(&dir).run_from_store(&registry, &world).unwrap();
    assert!(report.is_success());
    assert_eq!(world.applies(), vec!["b"]);
    assert_eq!(report.outcome_of("b"), Some(StepOutcome::DriftCorrected));
    assert_eq!(report.outcome_of("a"), Some(StepOutcome::Verified));
    assert_eq!(report.outcome_of("c"), Some(StepOutcome::Verified));
}

#[test]
fn test_changed_content_reapplies_live_step() {
    let dir = TempDir::new().unwrap();
    let world = World::default();
    *world.content.borrow_mut() = "port 1883".into();

    let mut registry = StepRegistry::new();
    registry.register(
        step("config").with_fingerprint(|w: &World| Ok(w.content.borrow().clone())),
    );

    orchestrator(&dir).run_from_store(&registry, &world).unwrap();
    world.clear_log();

    *world.content.borrow_mut() = "port 1884".into();
    let report = orchestrator(&dir).run_from_store(&registry, &world).unwrap();
    assert_eq!(world.applies(), vec!["config"]);
    assert_eq!(report.state.get("config").unwrap().content_hash, "port 1884");
}

#[test]
fn test_cycle_is_rejected_before_any_step() {
    let dir = TempDir::new().unwrap();
    let world = World::default();
    let mut registry = StepRegistry::new();
    registry
        .register(step("a").after("c"))
        .register(step("b").after("a"))
        .register(step("c").after("b"));

    let err = orchestrator(&dir)
        .run_from_store(&registry, &world)
        .unwrap_err();
    assert!(matches!(err, HubError::DependencyCycle { .. }));
    assert!(world.applies().is_empty());
}

#[test]
fn test_unknown_dependency_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let world = World::default();
    let mut registry = StepRegistry::new();
    registry.register(step("a").after("missing"));

    let err = orchestrator(&dir)
        .run_from_store(&registry, &world)
        .unwrap_err();
    assert!(matches!(err, HubError::Config(_)));
}

#[test]
fn test_pre_existing_effects_are_recorded_without_apply() {
    let dir = TempDir::new().unwrap();
    let world = World::default();
    world.effects.borrow_mut().insert("a".into());
    let registry = registry();

    let report = orchestrator(&dir).run_from_store(&registry, &world).unwrap();
    assert_eq!(report.outcome_of("a"), Some(StepOutcome::Verified));
    assert!(report.state.is_recorded("a"));
    assert_eq!(world.applies(), vec!["b", "c"]);
}
