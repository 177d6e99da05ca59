//! Timestamped archives of the install directory with bounded retention.
//!
//! Archives are named `<prefix>_<YYYYMMDD_HHMMSS>.tar.gz` and live in a flat
//! backup directory. After each creation the rotator keeps the newest N and
//! deletes the rest; anything not matching the naming scheme is left alone.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Deployment;
use crate::error::{HubError, HubResult};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// How many archives to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    keep: usize,
}

impl RetentionPolicy {
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if `keep` is zero.
    pub fn new(keep: usize) -> HubResult<Self> {
        if keep == 0 {
            return Err(HubError::config("backup retention must be at least 1"));
        }
        Ok(Self { keep })
    }

    #[must_use]
    pub fn keep(&self) -> usize {
        self.keep
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { keep: 5 }
    }
}

/// One archive in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub created_at: NaiveDateTime,
    pub size_bytes: u64,
}

/// What a rotation pass did.
#[derive(Debug, Default, Serialize)]
pub struct RotationSummary {
    pub kept: Vec<BackupRecord>,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Result of `backup`: the new archive, if any, and the rotation after it.
#[derive(Debug, Serialize)]
pub struct BackupOutcome {
    pub created: Option<BackupRecord>,
    pub rotation: RotationSummary,
}

/// Creates and prunes archives of one source directory.
#[derive(Debug, Clone)]
pub struct BackupRotator {
    source_dir: PathBuf,
    backup_dir: PathBuf,
    prefix: String,
    policy: RetentionPolicy,
}

impl BackupRotator {
    #[must_use]
    pub fn new(
        source_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            backup_dir: backup_dir.into(),
            prefix: prefix.into(),
            policy,
        }
    }

    /// Rotator for the deployment's install directory.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if the configured retention is invalid.
    pub fn from_deployment(deployment: &Deployment) -> HubResult<Self> {
        let backup = &deployment.config.backup;
        Ok(Self::new(
            &deployment.paths.install_dir,
            &deployment.paths.backup_dir,
            backup.prefix.clone(),
            RetentionPolicy::new(backup.retention)?,
        ))
    }

    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    #[must_use]
    pub fn archive_name(&self, at: NaiveDateTime) -> String {
        format!("{}_{}{ARCHIVE_SUFFIX}", self.prefix, at.format(TIMESTAMP_FORMAT))
    }

    /// Timestamp encoded in an archive name, `None` for foreign files.
    #[must_use]
    pub fn parse_archive_name(&self, name: &str) -> Option<NaiveDateTime> {
        let stamp = name
            .strip_suffix(ARCHIVE_SUFFIX)?
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
    }

    /// Archives in the backup directory, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::BackupIo`] if the directory cannot be read.
    pub fn list(&self) -> HubResult<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HubError::backup_io(&self.backup_dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HubError::backup_io(&self.backup_dir, e))?;
            let name = entry.file_name();
            let Some(created_at) = name.to_str().and_then(|n| self.parse_archive_name(n)) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            records.push(BackupRecord {
                path: entry.path(),
                created_at,
                size_bytes: meta.len(),
            });
        }

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(records)
    }

    /// Create an archive stamped with the current local time.
    ///
    /// # Errors
    ///
    /// See [`BackupRotator::create_at`].
    pub fn create(&self) -> HubResult<BackupRecord> {
        self.create_at(Local::now().naive_local())
    }

    /// Create an archive stamped `at`.
    ///
    /// The archive is assembled in a hidden `.partial` file and renamed into
    /// place once complete.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::BackupIo`] if the source is missing, an archive with
    /// the same name exists, or writing fails.
    pub fn create_at(&self, at: NaiveDateTime) -> HubResult<BackupRecord> {
        if !self.source_dir.is_dir() {
            return Err(HubError::backup_io(
                &self.source_dir,
                io::Error::new(io::ErrorKind::NotFound, "source directory does not exist"),
            ));
        }
        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| HubError::backup_io(&self.backup_dir, e))?;

        let name = self.archive_name(at);
        let dest = self.backup_dir.join(&name);
        if dest.exists() {
            return Err(HubError::backup_io(
                &dest,
                io::Error::new(io::ErrorKind::AlreadyExists, "archive already exists"),
            ));
        }
        let partial = self.backup_dir.join(format!(".{name}.partial"));

        info!(source = %self.source_dir.display(), archive = %dest.display(), "Creating backup");
        if let Err(e) = self.write_archive(&partial) {
            if let Err(cleanup) = fs::remove_file(&partial) {
                debug!(error = %cleanup, "No partial archive to clean up");
            }
            return Err(HubError::backup_io(&partial, e));
        }
        fs::rename(&partial, &dest).map_err(|e| HubError::backup_io(&dest, e))?;

        let size_bytes = fs::metadata(&dest)
            .map_err(|e| HubError::backup_io(&dest, e))?
            .len();
        info!(archive = %dest.display(), size_bytes, "Backup created");
        Ok(BackupRecord {
            path: dest,
            created_at: at,
            size_bytes,
        })
    }

    fn write_archive(&self, partial: &Path) -> io::Result<()> {
        let file = File::create(partial)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);

        let root = self
            .source_dir
            .file_name()
            .map_or_else(|| PathBuf::from("install"), PathBuf::from);
        let skip = [self.backup_dir.clone(), partial.to_path_buf()];
        builder.append_dir(&root, &self.source_dir)?;
        append_tree(&mut builder, &self.source_dir, &root, &skip)?;

        let file = builder.into_inner()?.finish()?;
        file.sync_all()
    }

    /// Keep the newest N archives and delete the rest.
    ///
    /// A failed deletion is logged and recorded; the remaining deletions
    /// still happen.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::BackupIo`] if the backup directory cannot be listed.
    pub fn rotate(&self) -> HubResult<RotationSummary> {
        self.rotate_with(|path| fs::remove_file(path))
    }

    fn rotate_with(
        &self,
        mut remove: impl FnMut(&Path) -> io::Result<()>,
    ) -> HubResult<RotationSummary> {
        let mut records = self.list()?;
        let excess = records.split_off(records.len().min(self.policy.keep()));
        let mut summary = RotationSummary {
            kept: records,
            ..RotationSummary::default()
        };

        for record in excess {
            match remove(&record.path) {
                Ok(()) => {
                    info!(archive = %record.path.display(), "Deleted old backup");
                    summary.deleted.push(record.path);
                }
                Err(e) => {
                    warn!(archive = %record.path.display(), error = %e, "Failed to delete old backup");
                    summary.failed.push(record.path);
                }
            }
        }
        Ok(summary)
    }

    /// Create a backup (unless `prune_only`) and then rotate.
    ///
    /// A failed creation returns before rotation, so existing backups are
    /// never trimmed on behalf of an archive that was not written.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::BackupIo`] on creation or listing failure.
    pub fn run(&self, prune_only: bool) -> HubResult<BackupOutcome> {
        let created = if prune_only {
            None
        } else {
            Some(self.create()?)
        };
        let rotation = self.rotate()?;
        Ok(BackupOutcome { created, rotation })
    }
}

fn append_tree<W: io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    archive_dir: &Path,
    skip: &[PathBuf],
) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        if skip.iter().any(|s| *s == path) {
            debug!(path = %path.display(), "Excluding from archive");
            continue;
        }
        let name = archive_dir.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir(&name, &path)?;
            append_tree(builder, &path, &name, skip)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }
    Ok(())
}
