use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use super::{text_hash, Resource};
use crate::system::System;

/// A system account without a login shell.
#[derive(Debug, Clone)]
pub struct SystemUser {
    name: String,
}

impl SystemUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Resource for SystemUser {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        sys.user_exists(&self.name)
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        info!(user = %self.name, "Creating system user");
        sys.create_system_user(&self.name)
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        Ok(text_hash(&self.name))
    }
}

/// A directory owned by `owner:owner`.
#[derive(Debug, Clone)]
pub struct OwnedDir {
    path: PathBuf,
    owner: String,
}

impl OwnedDir {
    pub fn new(path: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            path: path.into(),
            owner: format!("{owner}:{owner}"),
        }
    }
}

impl Resource for OwnedDir {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        Ok(sys.owner_of(&self.path)?.as_deref() == Some(self.owner.as_str()))
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        sys.ensure_dir(&self.path, &self.owner)
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        Ok(text_hash(&format!("{}:{}", self.path.display(), self.owner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeSystem;

    #[test]
    fn test_system_user_created_once() {
        let sys = FakeSystem::default();
        let user = SystemUser::new("victoria-metrics");
        assert!(!user.check(&sys).unwrap());
        user.apply(&sys).unwrap();
        assert!(user.check(&sys).unwrap());
    }

    #[test]
    fn test_owned_dir_reowns_existing_dir() {
        let sys = FakeSystem::default();
        sys.dirs
            .borrow_mut()
            .insert("/var/lib/victoria-metrics".into(), "root:root".into());
        let dir = OwnedDir::new("/var/lib/victoria-metrics", "victoria-metrics");
        assert!(!dir.check(&sys).unwrap());
        dir.apply(&sys).unwrap();
        assert!(dir.check(&sys).unwrap());
    }
}
