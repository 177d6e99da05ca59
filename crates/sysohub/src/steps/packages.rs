use anyhow::Result;
use tracing::debug;

use super::{text_hash, Resource};
use crate::system::System;

/// A set of Debian packages that must be installed.
#[derive(Debug, Clone)]
pub struct Packages {
    names: Vec<String>,
}

impl Packages {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    fn missing(&self, sys: &dyn System) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for name in &self.names {
            if !sys.package_installed(name)? {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }
}

impl Resource for Packages {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        Ok(self.missing(sys)?.is_empty())
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        let missing = self.missing(sys)?;
        if missing.is_empty() {
            return Ok(());
        }
        debug!(?missing, "Installing missing packages");
        sys.install_packages(&missing)
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        let mut names = self.names.clone();
        names.sort();
        Ok(text_hash(&names.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeSystem;

    #[test]
    fn test_installs_only_missing() {
        let sys = FakeSystem::default();
        sys.packages.borrow_mut().insert("hostapd".into());
        let pkgs = Packages::new(["hostapd", "dnsmasq"]);

        assert!(!pkgs.check(&sys).unwrap());
        pkgs.apply(&sys).unwrap();
        assert!(pkgs.check(&sys).unwrap());
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let sys = FakeSystem::default();
        assert_eq!(
            Packages::new(["a", "b"]).fingerprint(&sys).unwrap(),
            Packages::new(["b", "a"]).fingerprint(&sys).unwrap()
        );
    }
}
