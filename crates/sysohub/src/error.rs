//! Error taxonomy for provisioning, backup and flashing.
//!
//! Everything below a component boundary (orchestrator, rotator, provisioner)
//! is classified into one of these variants before it reaches the CLI.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used by the public entry points of this crate.
pub type HubResult<T> = Result<T, HubError>;

/// Errors surfaced by the gateway tooling.
#[derive(Debug, Error)]
pub enum HubError {
    /// Configuration file missing, malformed or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The step registry contains a dependency cycle.
    #[error("dependency cycle in step registry: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    /// Live state of a step could not be inspected.
    #[error("precondition check failed for step '{step}': {source:#}")]
    PreconditionCheck {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// A step's apply operation failed. Prior progress is preserved.
    #[error("step '{step}' failed: {source:#}")]
    StepApply {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// Creating, listing or pruning backups failed.
    #[error("backup error at {}: {source}", .path.display())]
    BackupIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Image flashing failed.
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    /// Another orchestrator run holds the lock.
    #[error("another setup run is in progress (lock held on {})", .0.display())]
    AlreadyRunning(PathBuf),

    /// The state file could not be read or written.
    #[error("state store error at {}: {message}", .path.display())]
    State { path: PathBuf, message: String },
}

impl HubError {
    /// Build a configuration error from anything printable.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn backup_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::BackupIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn state(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::State {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Failures of the image provisioner, each reported distinctly.
#[derive(Debug, Error)]
pub enum FlashError {
    /// No target device was given.
    #[error("no target device given (usage: sysohub-flash <device>)")]
    MissingDevice,

    /// The target device path does not exist.
    #[error("target device {} does not exist", .0.display())]
    DeviceNotFound(PathBuf),

    /// The base OS image is missing.
    #[error("base image {} not found", .0.display())]
    ImageNotFound(PathBuf),

    /// The configuration file to inject is missing.
    #[error("configuration file {} not found", .0.display())]
    ConfigNotFound(PathBuf),

    /// Raw copy or flush to the device failed.
    #[error("writing image to {} failed: {source}", .device.display())]
    Write {
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The boot partition could not be mounted.
    #[error("mounting {} failed: {message}", .partition.display())]
    Mount { partition: PathBuf, message: String },

    /// Creating or copying a file on the boot partition failed.
    #[error("writing {} on boot partition failed: {source}", .path.display())]
    Inject {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The boot partition could not be unmounted.
    #[error("unmounting {} failed: {message}", .mount_point.display())]
    Unmount {
        mount_point: PathBuf,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = HubError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle in step registry: a -> b -> a"
        );
    }

    #[test]
    fn test_step_apply_includes_context_chain() {
        let source = anyhow::anyhow!("exit status 100").context("apt-get install failed");
        let err = HubError::StepApply {
            step: "broker.packages".into(),
            source,
        };
        let msg = err.to_string();
        assert!(msg.contains("broker.packages"));
        assert!(msg.contains("apt-get install failed"));
        assert!(msg.contains("exit status 100"));
    }

    #[test]
    fn test_flash_error_converts() {
        let err: HubError = FlashError::MissingDevice.into();
        assert!(err.to_string().starts_with("flash error"));
    }
}
