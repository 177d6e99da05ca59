use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tracing::info;

use super::{text_hash, Resource};
use crate::system::{FilePerms, System};

/// Pull a single file out of a `.tar.gz` archive by file name.
///
/// # Errors
///
/// Returns an error if the archive is unreadable or has no such member.
pub fn extract_member(archive: &[u8], member: &str) -> Result<Vec<u8>> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    for entry in tar.entries().context("Failed to read release archive")? {
        let mut entry = entry.context("Corrupt entry in release archive")?;
        let matches = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n == member))
            .unwrap_or(false);
        if matches {
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .with_context(|| format!("Failed to extract {member}"))?;
            return Ok(bytes);
        }
    }
    bail!("Release archive has no member named {member}")
}

/// A binary installed from a release tarball.
///
/// The fingerprint is the download URL, so a version bump re-installs.
#[derive(Debug, Clone)]
pub struct ReleaseBinary {
    url: String,
    member: String,
    dest: PathBuf,
}

impl ReleaseBinary {
    pub fn new(url: impl Into<String>, member: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            member: member.into(),
            dest: dest.into(),
        }
    }
}

impl Resource for ReleaseBinary {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        Ok(sys.is_executable(&self.dest))
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        let scratch = tempfile::tempdir().context("Failed to create download directory")?;
        let archive_path = scratch.path().join("release.tar.gz");
        sys.download(&self.url, &archive_path)?;

        let archive = std::fs::read(&archive_path)
            .with_context(|| format!("Failed to read {}", archive_path.display()))?;
        let binary = extract_member(&archive, &self.member)?;

        info!(dest = %self.dest.display(), bytes = binary.len(), "Installing binary");
        sys.write_file(&self.dest, &binary, &FilePerms::root(0o755))
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        Ok(text_hash(&self.url))
    }
}

/// A package installed globally with npm, detected by its program name.
#[derive(Debug, Clone)]
pub struct NpmGlobal {
    package: String,
    program: String,
}

impl NpmGlobal {
    pub fn new(package: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            program: program.into(),
        }
    }
}

impl Resource for NpmGlobal {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        Ok(sys.find_program(&self.program).is_some())
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        info!(package = %self.package, "Installing npm package globally");
        sys.run(
            "npm",
            &["install", "-g", "--unsafe-perm", self.package.as_str()],
        )?;
        Ok(())
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        Ok(text_hash(&self.package))
    }
}
