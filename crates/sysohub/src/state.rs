//! Setup state persistence.
//!
//! This module records which provisioning steps completed and with what
//! content, so re-runs can skip verified work and resume after failures.
//! The store is replaced atomically on every write.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HubError, HubResult};

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

/// Completion record for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// When the step was applied or first verified.
    pub completed_at: DateTime<Utc>,
    /// Hash of the content the step applied.
    pub content_hash: String,
}

/// Mapping from step id to its completion record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub steps: BTreeMap<String, CompletionRecord>,
}

impl SetupState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            steps: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, step: &str) -> Option<&CompletionRecord> {
        self.steps.get(step)
    }

    #[must_use]
    pub fn is_recorded(&self, step: &str) -> bool {
        self.steps.contains_key(step)
    }

    /// Record `step` as complete with the given content hash, stamped now.
    pub fn record(&mut self, step: &str, content_hash: impl Into<String>) {
        self.steps.insert(
            step.to_string(),
            CompletionRecord {
                completed_at: Utc::now(),
                content_hash: content_hash.into(),
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Durable home of a [`SetupState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state, returning an empty state if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::State`] if the file exists but cannot be read or
    /// parsed, or was written by a newer format version.
    pub fn load(&self) -> HubResult<SetupState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting fresh");
                return Ok(SetupState::new());
            }
            Err(e) => return Err(HubError::state(&self.path, format!("read failed: {e}"))),
        };

        let state: SetupState = serde_json::from_str(&content)
            .map_err(|e| HubError::state(&self.path, format!("parse failed: {e}")))?;
        if state.version > STATE_VERSION {
            return Err(HubError::state(
                &self.path,
                format!(
                    "state version {} is newer than supported version {STATE_VERSION}",
                    state.version
                ),
            ));
        }

        info!(steps = state.len(), "Loaded setup state");
        Ok(state)
    }

    /// Persist state by writing a sibling temp file and renaming it over the
    /// store, so readers only ever see a complete document.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::State`] if any part of the write fails.
    pub fn save(&self, state: &SetupState) -> HubResult<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| HubError::state(&self.path, format!("create dir failed: {e}")))?;

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| HubError::state(&self.path, format!("serialize failed: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| HubError::state(&self.path, format!("temp file failed: {e}")))?;
        tmp.write_all(&content)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| HubError::state(&self.path, format!("write failed: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| HubError::state(&self.path, format!("rename failed: {}", e.error)))?;

        // Make the rename itself durable.
        if let Ok(handle) = std::fs::File::open(dir) {
            let _ = handle.sync_all();
        }

        debug!(path = %self.path.display(), steps = state.len(), "Saved setup state");
        Ok(())
    }
}
