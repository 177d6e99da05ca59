//! Writes a base OS image to a removable device and seeds its boot partition.
//!
//! The boot partition receives an empty `ssh` marker, an empty
//! `wpa_supplicant.conf` placeholder and a verbatim copy of the device
//! configuration. Once the partition is mounted it is always unmounted again,
//! whether injection succeeds or not.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{FlashError, HubResult};

/// Raw copy buffer size.
pub const COPY_BUFFER: usize = 4 * 1024 * 1024;

/// Marker that enables sshd on first boot.
pub const SSH_MARKER: &str = "ssh";
/// Placeholder for Wi-Fi client credentials.
pub const WPA_PLACEHOLDER: &str = "wpa_supplicant.conf";

/// Mounts and unmounts partitions for the provisioner.
pub trait Mounter {
    /// Wait for the kernel to pick up a rewritten partition table.
    fn settle(&self, _device: &Path) {}

    /// Mount `partition` at a fresh scoped directory and return it.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the mount failed.
    fn mount(&self, partition: &Path) -> Result<PathBuf, String>;

    /// Unmount `mount_point` and remove the directory.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the unmount failed.
    fn unmount(&self, mount_point: &Path) -> Result<(), String>;
}

/// Mounts with `mount(8)` under the system temp directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

impl HostMounter {
    fn command(program: &str, args: &[&str]) -> Result<(), String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("failed to run {program} - is it installed? {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl Mounter for HostMounter {
    fn settle(&self, device: &Path) {
        let device = device.to_string_lossy();
        if let Err(e) = Self::command("partprobe", &[&device]) {
            debug!(error = %e, "partprobe failed");
        }
        if let Err(e) = Self::command("udevadm", &["settle"]) {
            debug!(error = %e, "udevadm settle failed");
        }
    }

    fn mount(&self, partition: &Path) -> Result<PathBuf, String> {
        let mount_point = mount_dir()?;

        let source = partition.to_string_lossy();
        let target = mount_point.to_string_lossy();
        if let Err(e) = Self::command("mount", &[&source, &target]) {
            // Only ever an empty directory here; never delete recursively.
            let _ = fs::remove_dir(&mount_point);
            return Err(e);
        }
        Ok(mount_point)
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), String> {
        let target = mount_point.to_string_lossy();
        Self::command("umount", &[&target])?;
        fs::remove_dir(mount_point)
            .map_err(|e| format!("cannot remove {}: {e}", mount_point.display()))
    }
}

/// Fresh, uniquely named empty directory to mount over. Ownership moves to
/// the caller, who removes it after unmounting.
fn mount_dir() -> Result<PathBuf, String> {
    tempfile::Builder::new()
        .prefix("sysohub-flash-")
        .tempdir()
        .map(tempfile::TempDir::into_path)
        .map_err(|e| format!("cannot create mount point: {e}"))
}

/// Boot partition of a block device: `p1` for names ending in a digit
/// (`mmcblk0p1`, `nvme0n1p1`), otherwise `1` (`sda1`).
#[must_use]
pub fn boot_partition(device: &Path) -> PathBuf {
    let name = device.to_string_lossy();
    if name.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p1"))
    } else {
        PathBuf::from(format!("{name}1"))
    }
}

/// What a successful provisioning run did.
#[derive(Debug, Clone, Serialize)]
pub struct FlashReport {
    pub device: PathBuf,
    pub partition: PathBuf,
    pub bytes_written: u64,
    pub injected: Vec<String>,
}

/// Unmounts on drop unless [`MountGuard::release`] already did.
struct MountGuard<'a, M: Mounter + ?Sized> {
    mounter: &'a M,
    mount_point: Option<PathBuf>,
}

impl<M: Mounter + ?Sized> MountGuard<'_, M> {
    fn path(&self) -> &Path {
        self.mount_point.as_deref().unwrap_or_else(|| Path::new(""))
    }

    fn release(mut self) -> Result<(), FlashError> {
        match self.mount_point.take() {
            Some(mount_point) => self
                .mounter
                .unmount(&mount_point)
                .map_err(|message| FlashError::Unmount {
                    mount_point,
                    message,
                }),
            None => Ok(()),
        }
    }
}

impl<M: Mounter + ?Sized> Drop for MountGuard<'_, M> {
    fn drop(&mut self) {
        if let Some(mount_point) = self.mount_point.take() {
            if let Err(e) = self.mounter.unmount(&mount_point) {
                warn!(mount_point = %mount_point.display(), error = %e, "Failed to unmount after error");
            }
        }
    }
}

/// Flashes images with a pluggable [`Mounter`].
pub struct ImageProvisioner<M> {
    mounter: M,
}

impl<M: Mounter> ImageProvisioner<M> {
    pub fn new(mounter: M) -> Self {
        Self { mounter }
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Write `image` to `device` and inject `config` into its boot partition.
    ///
    /// All inputs are validated before the device is opened.
    ///
    /// # Errors
    ///
    /// Returns a [`FlashError`] (wrapped in [`crate::HubError::Flash`]) for the
    /// failing phase, or [`crate::HubError::Config`] if `config` is invalid.
    pub fn provision(
        &self,
        device: Option<&str>,
        image: &Path,
        config: &Path,
    ) -> HubResult<FlashReport> {
        let device = match device.map(str::trim) {
            Some(d) if !d.is_empty() => PathBuf::from(d),
            _ => return Err(FlashError::MissingDevice.into()),
        };
        if !device.exists() {
            return Err(FlashError::DeviceNotFound(device).into());
        }
        if !image.is_file() {
            return Err(FlashError::ImageNotFound(image.to_path_buf()).into());
        }
        if !config.is_file() {
            return Err(FlashError::ConfigNotFound(config.to_path_buf()).into());
        }
        HubConfig::load(config)?;

        info!(image = %image.display(), device = %device.display(), "Writing image");
        let bytes_written = copy_image(image, &device).map_err(|source| FlashError::Write {
            device: device.clone(),
            source,
        })?;
        info!(bytes_written, "Image written and flushed");

        self.mounter.settle(&device);
        let partition = boot_partition(&device);
        let mount_point = self
            .mounter
            .mount(&partition)
            .map_err(|message| FlashError::Mount {
                partition: partition.clone(),
                message,
            })?;
        debug!(mount_point = %mount_point.display(), "Boot partition mounted");
        let guard = MountGuard {
            mounter: &self.mounter,
            mount_point: Some(mount_point),
        };

        let injected = inject(guard.path(), config)?;
        guard.release()?;

        info!(device = %device.display(), "Device provisioned");
        Ok(FlashReport {
            device,
            partition,
            bytes_written,
            injected,
        })
    }
}

fn copy_image(image: &Path, device: &Path) -> io::Result<u64> {
    let mut reader = File::open(image)?;
    let mut writer = OpenOptions::new().write(true).open(device)?;
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    writer.sync_all()?;
    Ok(total)
}

fn inject_err(path: PathBuf) -> impl FnOnce(io::Error) -> FlashError {
    move |source| FlashError::Inject { path, source }
}

fn inject(boot: &Path, config: &Path) -> Result<Vec<String>, FlashError> {
    let mut injected = Vec::new();

    for marker in [SSH_MARKER, WPA_PLACEHOLDER] {
        let path = boot.join(marker);
        File::create(&path)
            .and_then(|f| f.sync_all())
            .map_err(inject_err(path.clone()))?;
        injected.push(marker.to_string());
    }

    let name = config
        .file_name()
        .map_or_else(|| "config.yml".to_string(), |n| n.to_string_lossy().into_owned());
    let dest = boot.join(&name);
    fs::copy(config, &dest)
        .and_then(|_| File::open(&dest)?.sync_all())
        .map_err(inject_err(dest.clone()))?;
    injected.push(name);

    Ok(injected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_dirs_are_unique_and_kept() {
        let first = mount_dir().unwrap();
        let second = mount_dir().unwrap();
        assert_ne!(first, second);
        for dir in [&first, &second] {
            assert!(dir.is_dir());
            assert!(dir
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("sysohub-flash-"));
            assert_eq!(fs::read_dir(dir).unwrap().count(), 0);
            fs::remove_dir(dir).unwrap();
        }
    }

    #[test]
    fn test_boot_partition_naming() {
        assert_eq!(boot_partition(Path::new("/dev/sda")), PathBuf::from("/dev/sda1"));
        assert_eq!(
            boot_partition(Path::new("/dev/mmcblk0")),
            PathBuf::from("/dev/mmcblk0p1")
        );
        assert_eq!(
            boot_partition(Path::new("/dev/nvme0n1")),
            PathBuf::from("/dev/nvme0n1p1")
        );
    }

    #[test]
    fn test_copy_image_writes_all_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("os.img");
        let device = dir.path().join("disk");
        let data: Vec<u8> = (0..COPY_BUFFER + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&image, &data).unwrap();
        File::create(&device).unwrap();

        assert_eq!(copy_image(&image, &device).unwrap(), data.len() as u64);
        assert_eq!(fs::read(&device).unwrap(), data);
    }

    #[test]
    fn test_copy_image_never_creates_device() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("os.img");
        fs::write(&image, b"img").unwrap();
        assert!(copy_image(&image, &dir.path().join("absent")).is_err());
    }
}
