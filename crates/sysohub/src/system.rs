//! Narrow interface to the host operating system.
//!
//! Provisioning steps never shell out directly; they go through [`System`],
//! which [`HostSystem`] implements with apt, systemd and coreutils. Tests use
//! an in-memory implementation.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

/// Mode and ownership applied to a managed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePerms {
    pub mode: u32,
    /// `user` or `user:group`; `None` leaves ownership as created.
    pub owner: Option<String>,
}

impl FilePerms {
    #[must_use]
    pub fn root(mode: u32) -> Self {
        Self {
            mode,
            owner: Some("root:root".into()),
        }
    }

    #[must_use]
    pub fn owned_by(owner: &str, mode: u32) -> Self {
        Self {
            mode,
            owner: Some(format!("{owner}:{owner}")),
        }
    }
}

/// Operations the provisioning steps need from the host.
pub trait System {
    /// Whether a Debian package is installed.
    fn package_installed(&self, package: &str) -> Result<bool>;

    /// Install packages non-interactively.
    fn install_packages(&self, packages: &[String]) -> Result<()>;

    /// Whether a systemd unit is enabled.
    fn unit_enabled(&self, unit: &str) -> Result<bool>;

    /// Whether a systemd unit is active.
    fn unit_active(&self, unit: &str) -> Result<bool>;

    /// Unmask and enable a unit.
    fn enable_unit(&self, unit: &str) -> Result<()>;

    /// Restart (or start) a unit.
    fn restart_unit(&self, unit: &str) -> Result<()>;

    /// Reload systemd unit definitions.
    fn daemon_reload(&self) -> Result<()>;

    /// Read a file, `None` if it does not exist.
    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Atomically replace a file and apply permissions.
    fn write_file(&self, path: &Path, contents: &[u8], perms: &FilePerms) -> Result<()>;

    /// `user:group` owning a path, `None` if it does not exist.
    fn owner_of(&self, path: &Path) -> Result<Option<String>>;

    /// Create a directory tree with the given ownership.
    fn ensure_dir(&self, path: &Path, owner: &str) -> Result<()>;

    /// Whether `path` is an executable regular file.
    fn is_executable(&self, path: &Path) -> bool;

    /// Resolve a program on `PATH`.
    fn find_program(&self, name: &str) -> Option<PathBuf>;

    /// Whether a local user account exists.
    fn user_exists(&self, user: &str) -> Result<bool>;

    /// Create a system account without a login shell.
    fn create_system_user(&self, user: &str) -> Result<()>;

    /// Run a program to completion, returning trimmed stdout.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Download `url` to `dest`.
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// The real host, driven through apt, systemctl and coreutils.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSystem;

impl HostSystem {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run a command and return (success, stdout).
    fn probe(program: &str, args: &[&str]) -> Result<(bool, String)> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {program} - is it installed?"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((output.status.success(), stdout))
    }
}

impl System for HostSystem {
    fn package_installed(&self, package: &str) -> Result<bool> {
        let (ok, stdout) = Self::probe("dpkg-query", &["-W", "-f=${Status}", package])?;
        Ok(ok && stdout.ends_with("install ok installed"))
    }

    fn install_packages(&self, packages: &[String]) -> Result<()> {
        info!(packages = ?packages, "Installing packages");
        self.run("apt-get", &["update"])?;
        let mut args = vec!["install", "-y", "--no-install-recommends"];
        args.extend(packages.iter().map(String::as_str));
        let output = Command::new("apt-get")
            .args(&args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .output()
            .context("Failed to run apt-get install")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("apt-get install failed: {}", stderr.trim());
        }
        Ok(())
    }

    fn unit_enabled(&self, unit: &str) -> Result<bool> {
        let (_, stdout) = Self::probe("systemctl", &["is-enabled", unit])?;
        Ok(stdout == "enabled")
    }

    fn unit_active(&self, unit: &str) -> Result<bool> {
        let (_, stdout) = Self::probe("systemctl", &["is-active", unit])?;
        Ok(stdout == "active")
    }

    fn enable_unit(&self, unit: &str) -> Result<()> {
        // Debian ships hostapd masked.
        self.run("systemctl", &["unmask", unit])?;
        self.run("systemctl", &["enable", unit])?;
        Ok(())
    }

    fn restart_unit(&self, unit: &str) -> Result<()> {
        self.run("systemctl", &["restart", unit])?;
        Ok(())
    }

    fn daemon_reload(&self) -> Result<()> {
        self.run("systemctl", &["daemon-reload"])?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn write_file(&self, path: &Path, contents: &[u8], perms: &FilePerms) -> Result<()> {
        let dir = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(perms.mode))?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        if let Some(owner) = &perms.owner {
            let target = path.to_string_lossy();
            self.run("chown", &[owner.as_str(), &*target])?;
        }
        debug!(path = %path.display(), bytes = contents.len(), "Wrote managed file");
        Ok(())
    }

    fn owner_of(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let target = path.to_string_lossy();
        Ok(Some(self.run("stat", &["-c", "%U:%G", &*target])?))
    }

    fn ensure_dir(&self, path: &Path, owner: &str) -> Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let target = path.to_string_lossy();
        self.run("chown", &["-R", owner, &*target])?;
        Ok(())
    }

    fn is_executable(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn user_exists(&self, user: &str) -> Result<bool> {
        let (ok, _) = Self::probe("id", &["-u", user])?;
        Ok(ok)
    }

    fn create_system_user(&self, user: &str) -> Result<()> {
        self.run(
            "useradd",
            &["--system", "--no-create-home", "--shell", "/usr/sbin/nologin", user],
        )?;
        Ok(())
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "Running command");
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {program} - is it installed?"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{program} {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!(url, "Downloading");
        let mut response = reqwest::blocking::get(url)
            .with_context(|| format!("Failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("Download of {url} was rejected"))?;
        let mut file = std::fs::File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        file.sync_all()?;
        Ok(())
    }
}
