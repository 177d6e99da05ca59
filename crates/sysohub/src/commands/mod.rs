//! Subcommand implementations.

pub mod backup;
pub mod setup;
pub mod status;

use std::path::Path;

use anyhow::Result;
use sysohub::{Deployment, HubError};

/// Mutating commands run as root so they can manage packages and units.
pub fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(HubError::config("this command must be run as root (try sudo)").into());
    }
    Ok(())
}

/// Resolve identity and load the configuration.
pub fn load_deployment(config: Option<&Path>) -> Result<Deployment> {
    let deployment = Deployment::load(config)?;
    tracing::debug!(
        config = %deployment.paths.config_file.display(),
        user = %deployment.identity.user,
        "Loaded deployment"
    );
    Ok(deployment)
}
