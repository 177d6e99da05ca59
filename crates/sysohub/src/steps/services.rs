use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use super::Resource;
use crate::step::combined_hash;
use crate::system::System;

/// A systemd unit that must be enabled and running.
///
/// The fingerprint covers the files the unit reads, so a changed
/// configuration makes the orchestrator restart the unit.
#[derive(Debug, Clone)]
pub struct Service {
    unit: String,
    watched: Vec<PathBuf>,
}

impl Service {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            watched: Vec::new(),
        }
    }

    #[must_use]
    pub fn watching(mut self, path: impl Into<PathBuf>) -> Self {
        self.watched.push(path.into());
        self
    }
}

impl Resource for Service {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        Ok(sys.unit_enabled(&self.unit)? && sys.unit_active(&self.unit)?)
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        info!(unit = %self.unit, "Enabling and restarting service");
        sys.daemon_reload()?;
        sys.enable_unit(&self.unit)?;
        sys.restart_unit(&self.unit)
    }

    fn fingerprint(&self, sys: &dyn System) -> Result<String> {
        let mut parts = vec![self.unit.clone().into_bytes()];
        for path in &self.watched {
            parts.push(sys.read_file(path)?.unwrap_or_default());
        }
        Ok(combined_hash(parts.iter().map(Vec::as_slice)))
    }
}
