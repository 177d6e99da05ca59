use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::Resource;
use crate::step::content_hash;
use crate::system::{FilePerms, System};

type ContentFn = Box<dyn Fn(&dyn System) -> Result<Vec<u8>>>;

/// A file whose content and ownership are owned by the tool.
///
/// Content is produced on demand so it can depend on host lookups made at
/// run time. The file is rewritten only when its hash or owner differs.
pub struct ManagedFile {
    path: PathBuf,
    perms: FilePerms,
    content: ContentFn,
}

impl ManagedFile {
    pub fn new(
        path: impl Into<PathBuf>,
        perms: FilePerms,
        content: impl Fn(&dyn System) -> Result<Vec<u8>> + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            perms,
            content: Box::new(content),
        }
    }

    /// A file with fixed content.
    pub fn fixed(path: impl Into<PathBuf>, perms: FilePerms, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self::new(path, perms, move |_| Ok(content.clone()))
    }

    /// A verbatim copy of another file on the host.
    pub fn copy_of(source: impl Into<PathBuf>, path: impl Into<PathBuf>, perms: FilePerms) -> Self {
        let source = source.into();
        Self::new(path, perms, move |sys| {
            sys.read_file(&source)?
                .with_context(|| format!("Source file {} not found", source.display()))
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The content this file should have.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be produced.
    pub fn desired(&self, sys: &dyn System) -> Result<Vec<u8>> {
        (self.content)(sys)
    }
}

impl Resource for ManagedFile {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        let Some(current) = sys.read_file(&self.path)? else {
            return Ok(false);
        };
        if content_hash(&current) != content_hash(&self.desired(sys)?) {
            return Ok(false);
        }
        match &self.perms.owner {
            Some(owner) => Ok(sys.owner_of(&self.path)?.as_deref() == Some(owner.as_str())),
            None => Ok(true),
        }
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        let desired = self.desired(sys)?;
        info!(path = %self.path.display(), "Writing managed file");
        sys.write_file(&self.path, &desired, &self.perms)
    }

    fn fingerprint(&self, sys: &dyn System) -> Result<String> {
        Ok(content_hash(&self.desired(sys)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeSystem;

    #[test]
    fn test_matching_content_and_owner_is_satisfied() {
        let sys = FakeSystem::default();
        let file = ManagedFile::fixed("/etc/x.conf", FilePerms::root(0o644), "a=1\n");
        sys.put_file("/etc/x.conf", b"a=1\n");
        assert!(file.check(&sys).unwrap());
    }

    #[test]
    fn test_changed_content_is_rewritten() {
        let sys = FakeSystem::default();
        let file = ManagedFile::fixed("/etc/x.conf", FilePerms::root(0o644), "a=2\n");
        sys.put_file("/etc/x.conf", b"a=1\n");
        assert!(!file.check(&sys).unwrap());
        file.apply(&sys).unwrap();
        assert_eq!(sys.file("/etc/x.conf").unwrap(), b"a=2\n");
        assert!(file.check(&sys).unwrap());
    }

    #[test]
    fn test_wrong_owner_is_unsatisfied() {
        let sys = FakeSystem::default();
        let file = ManagedFile::fixed("/home/pi/app.py", FilePerms::owned_by("pi", 0o644), "x");
        sys.put_file("/home/pi/app.py", b"x");
        assert!(!file.check(&sys).unwrap());
        file.apply(&sys).unwrap();
        assert!(file.check(&sys).unwrap());
    }

    #[test]
    fn test_copy_of_missing_source_fails() {
        let sys = FakeSystem::default();
        let file = ManagedFile::copy_of("/src/app.py", "/dst/app.py", FilePerms::root(0o644));
        assert!(file.fingerprint(&sys).is_err());
        sys.put_file("/src/app.py", b"print()");
        file.apply(&sys).unwrap();
        assert_eq!(sys.file("/dst/app.py").unwrap(), b"print()");
    }
}
