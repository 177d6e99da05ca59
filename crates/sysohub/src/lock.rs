//! Process-level mutual exclusion for orchestrator runs.
//!
//! Lock acquisition is atomic and exclusive via `flock(LOCK_EX | LOCK_NB)` on
//! a lock file under the install directory. The kernel drops the lock when
//! the descriptor closes, so a crashed run never leaves a stale lock behind.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{HubError, HubResult};

/// Held for the whole run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl RunLock {
    /// Try to take the lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::AlreadyRunning`] if another process holds it, or
    /// [`HubError::State`] if the lock file cannot be opened.
    pub fn acquire(path: &Path) -> HubResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HubError::state(path, format!("create lock dir failed: {e}")))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| HubError::state(path, format!("open lock file failed: {e}")))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(path = %path.display(), "Acquired run lock");
                Ok(Self {
                    path: path.to_path_buf(),
                    _lock: lock,
                })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(HubError::AlreadyRunning(path.to_path_buf()))
            }
            Err((_, errno)) => Err(HubError::state(path, format!("flock failed: {errno}"))),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Released run lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_refused_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".sysohub/setup.lock");

        let first = RunLock::acquire(&path).unwrap();
        let second = RunLock::acquire(&path);
        assert!(matches!(second, Err(HubError::AlreadyRunning(_))));
        drop(first);
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("setup.lock");
        {
            let _held = RunLock::acquire(&path).unwrap();
        }
        assert!(RunLock::acquire(&path).is_ok());
    }
}
