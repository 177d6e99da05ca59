//! Concrete provisioning steps for the gateway.
//!
//! Each step kind is a [`Resource`]: something on the host with a live check,
//! an apply operation and a content fingerprint. [`ManagedStep`] gives a
//! resource its id and dependencies so the orchestrator can schedule it.

mod accounts;
mod binaries;
mod broker;
mod files;
mod gateway;
mod host;
mod packages;
mod services;
mod upgrade;

pub use accounts::{OwnedDir, SystemUser};
pub use binaries::{extract_member, NpmGlobal, ReleaseBinary};
pub use broker::MosquittoPassword;
pub use files::ManagedFile;
pub use gateway::{gateway_registry, MANAGED_UNITS};
pub use host::{hosts_with_hostname, Hostname, Sysctl};
pub use packages::Packages;
pub use services::Service;
pub use upgrade::{restart_managed_units, upgrade_node_red, upgrade_os_packages};

use anyhow::Result;

use crate::step::{content_hash, Step};
use crate::system::System;

/// A host resource brought to a desired state.
pub trait Resource {
    /// Whether the resource is already in its desired state.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be inspected.
    fn check(&self, sys: &dyn System) -> Result<bool>;

    /// Bring the resource to its desired state.
    ///
    /// # Errors
    ///
    /// Returns an error if the change fails.
    fn apply(&self, sys: &dyn System) -> Result<()>;

    /// Hash of the desired state.
    ///
    /// # Errors
    ///
    /// Returns an error if the desired state cannot be computed.
    fn fingerprint(&self, sys: &dyn System) -> Result<String>;
}

/// A [`Resource`] registered under an id.
pub struct ManagedStep<R> {
    id: String,
    description: String,
    dependencies: Vec<String>,
    resource: R,
}

impl<R: Resource> ManagedStep<R> {
    pub fn new(id: impl Into<String>, description: impl Into<String>, resource: R) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            resource,
        }
    }

    #[must_use]
    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    #[must_use]
    pub fn after_all<'a>(mut self, dependencies: impl IntoIterator<Item = &'a str>) -> Self {
        self.dependencies
            .extend(dependencies.into_iter().map(ToString::to_string));
        self
    }
}

impl<R: Resource> Step<dyn System> for ManagedStep<R> {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn check(&self, sys: &dyn System) -> Result<bool> {
        self.resource.check(sys)
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        self.resource.apply(sys)
    }

    fn fingerprint(&self, sys: &dyn System) -> Result<String> {
        self.resource.fingerprint(sys)
    }
}

/// Fingerprint of a plain string value.
pub(crate) fn text_hash(value: &str) -> String {
    content_hash(value.as_bytes())
}
