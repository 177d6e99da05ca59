//! Configuration discovery through the process environment.

use std::fs;
use std::path::Path;

use nix::unistd::{geteuid, User};
use serial_test::serial;
use sysohub::{Deployment, HubError};
use tempfile::TempDir;

const CONFIG: &str = "project:
  name: Bench Hub
  hostname: benchhub
  wifi:
    ssid: benchhub-ap
    passphrase: changeme123
  mqtt:
    username: bench
    password: benchpass
  backup:
    prefix: bench
    retention: 3
";

/// Environment of a cron job or systemd timer: no `USER`, no `SUDO_USER`.
fn scheduled_env(home: &Path) {
    std::env::remove_var("SUDO_USER");
    std::env::remove_var("USER");
    std::env::set_var("LOGNAME", "root");
    std::env::set_var("HOME", home);
}

fn write_config(dir: &Path, install_dir: &Path) -> std::path::PathBuf {
    let path = dir.join("gateway.yml");
    let yaml = format!("{CONFIG}  paths:\n    install_dir: {}\n", install_dir.display());
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
#[serial]
fn test_scheduled_run_resolves_effective_user() {
    let home = TempDir::new().unwrap();
    scheduled_env(home.path());
    let install = home.path().join("hub");
    let config_file = write_config(home.path(), &install);

    let deployment = Deployment::load(Some(&config_file)).unwrap();

    let effective = User::from_uid(geteuid()).unwrap().unwrap();
    assert_eq!(deployment.identity.user, effective.name);
    assert_eq!(deployment.identity.home, effective.dir);
    assert_eq!(deployment.paths.config_file, config_file);
    assert_eq!(deployment.paths.install_dir, install);
    assert_eq!(
        deployment.paths.lock_file,
        install.join(".sysohub/setup.lock")
    );
    assert_eq!(deployment.config.backup.retention, 3);
}

#[test]
#[serial]
fn test_explicit_config_must_exist() {
    let home = TempDir::new().unwrap();
    scheduled_env(home.path());

    let err = Deployment::load(Some(&home.path().join("missing.yml"))).unwrap_err();
    assert!(matches!(err, HubError::Config(ref m) if m.contains("config not found")));
}

#[test]
#[serial]
fn test_unknown_sudo_user_is_refused() {
    let home = TempDir::new().unwrap();
    scheduled_env(home.path());
    std::env::set_var("SUDO_USER", "sysohub-test-nobody");
    let config_file = write_config(home.path(), &home.path().join("hub"));

    let err = Deployment::load(Some(&config_file)).unwrap_err();
    std::env::remove_var("SUDO_USER");
    assert!(err.to_string().contains("sysohub-test-nobody"));
}

#[test]
#[serial]
fn test_invalid_config_is_reported() {
    let home = TempDir::new().unwrap();
    scheduled_env(home.path());
    let config_file = home.path().join("bad.yml");
    fs::write(&config_file, CONFIG.replace("changeme123", "short")).unwrap();

    let err = Deployment::load(Some(&config_file)).unwrap_err();
    assert!(err.to_string().contains("passphrase"));
}
