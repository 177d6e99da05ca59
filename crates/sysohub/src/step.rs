//! Step model and dependency-ordered registry.
//!
//! A [`Step`] is one idempotent unit of provisioning work: a live
//! precondition check, an apply operation, and a fingerprint of the content it
//! applies. The [`StepRegistry`] orders steps topologically, breaking ties by
//! step id so the execution order is stable across runs.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::error::{HubError, HubResult};

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash several labelled parts into one fingerprint.
#[must_use]
pub fn combined_hash<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// One idempotent provisioning step, evaluated against a context `C`.
pub trait Step<C: ?Sized> {
    /// Unique id, stable across runs.
    fn id(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Ids of steps that must complete first.
    fn dependencies(&self) -> &[String];

    /// Whether the step's effect already holds on the live system.
    ///
    /// # Errors
    ///
    /// Returns an error if live state cannot be inspected.
    fn check(&self, ctx: &C) -> Result<bool>;

    /// Make the step's effect hold.
    ///
    /// # Errors
    ///
    /// Returns an error if the change could not be made.
    fn apply(&self, ctx: &C) -> Result<()>;

    /// Hash of the content this step applies. Recorded on completion; a change
    /// means the step must be re-applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the desired content cannot be produced.
    fn fingerprint(&self, _ctx: &C) -> Result<String> {
        Ok(content_hash(self.id().as_bytes()))
    }
}

/// A step assembled from closures.
#[allow(clippy::type_complexity)]
pub struct FnStep<C: ?Sized> {
    id: String,
    description: String,
    dependencies: Vec<String>,
    check: Box<dyn Fn(&C) -> Result<bool>>,
    apply: Box<dyn Fn(&C) -> Result<()>>,
    fingerprint: Option<Box<dyn Fn(&C) -> Result<String>>>,
}

impl<C: ?Sized> FnStep<C> {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        check: impl Fn(&C) -> Result<bool> + 'static,
        apply: impl Fn(&C) -> Result<()> + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            check: Box::new(check),
            apply: Box::new(apply),
            fingerprint: None,
        }
    }

    #[must_use]
    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    #[must_use]
    pub fn with_fingerprint(mut self, f: impl Fn(&C) -> Result<String> + 'static) -> Self {
        self.fingerprint = Some(Box::new(f));
        self
    }
}

impl<C: ?Sized> Step<C> for FnStep<C> {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn check(&self, ctx: &C) -> Result<bool> {
        (self.check)(ctx)
    }

    fn apply(&self, ctx: &C) -> Result<()> {
        (self.apply)(ctx)
    }

    fn fingerprint(&self, ctx: &C) -> Result<String> {
        match &self.fingerprint {
            Some(f) => f(ctx),
            None => Ok(content_hash(self.id.as_bytes())),
        }
    }
}

/// The set of steps making up a deployment.
pub struct StepRegistry<C: ?Sized> {
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C: ?Sized> Default for StepRegistry<C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<C: ?Sized> StepRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: impl Step<C> + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&dyn Step<C>> {
        self.steps.iter().find(|s| s.id() == id).map(AsRef::as_ref)
    }

    /// Topological order over the registry, ties broken by id.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] for duplicate ids or unknown dependencies
    /// and [`HubError::DependencyCycle`] if the graph is cyclic.
    pub fn resolve_order(&self) -> HubResult<Vec<&dyn Step<C>>> {
        let mut by_id: BTreeMap<&str, &dyn Step<C>> = BTreeMap::new();
        for step in &self.steps {
            if by_id.insert(step.id(), step.as_ref()).is_some() {
                return Err(HubError::config(format!("duplicate step id '{}'", step.id())));
            }
        }

        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (&id, step) in &by_id {
            let deps: BTreeSet<&str> = step.dependencies().iter().map(String::as_str).collect();
            for &dep in &deps {
                if !by_id.contains_key(dep) {
                    return Err(HubError::config(format!(
                        "step '{id}' depends on unknown step '{dep}'"
                    )));
                }
                dependents.entry(dep).or_default().push(id);
            }
            pending.insert(id, deps.len());
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|&(_, &n)| n == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(by_id.len());

        while let Some(id) = ready.pop_first() {
            order.push(by_id[id]);
            for &next in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(n) = pending.get_mut(next) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() < by_id.len() {
            let stuck: BTreeSet<&str> = pending
                .iter()
                .filter(|&(_, &n)| n > 0)
                .map(|(&id, _)| id)
                .collect();
            return Err(HubError::DependencyCycle {
                cycle: find_cycle(&by_id, &stuck),
            });
        }

        Ok(order)
    }
}

/// Walk dependency edges among `stuck` steps until a step repeats.
fn find_cycle<C: ?Sized>(
    by_id: &BTreeMap<&str, &dyn Step<C>>,
    stuck: &BTreeSet<&str>,
) -> Vec<String> {
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = by_id[current]
            .dependencies()
            .iter()
            .map(String::as_str)
            .filter(|d| stuck.contains(d))
            .min();
        let Some(next) = next else {
            return path.iter().map(ToString::to_string).collect();
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
