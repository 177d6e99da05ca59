use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use super::{text_hash, Resource};
use crate::system::{FilePerms, System};

const HOSTNAME_FILE: &str = "/etc/hostname";
const HOSTS_FILE: &str = "/etc/hosts";
const SYSCTL_FILE: &str = "/etc/sysctl.d/90-sysohub.conf";

/// The machine hostname and its loopback alias in `/etc/hosts`.
#[derive(Debug, Clone)]
pub struct Hostname {
    name: String,
}

impl Hostname {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Rewrite `/etc/hosts` so `127.0.1.1` maps to `hostname` only.
///
/// Every other line, including the `127.0.0.1 localhost` entry, is kept.
#[must_use]
pub fn hosts_with_hostname(current: &str, hostname: &str) -> String {
    let mut out: Vec<String> = current
        .lines()
        .filter(|line| line.split_whitespace().next() != Some("127.0.1.1"))
        .map(ToString::to_string)
        .collect();

    let alias = format!("127.0.1.1\t{hostname}");
    match out
        .iter()
        .position(|line| line.split_whitespace().next() == Some("127.0.0.1"))
    {
        Some(pos) => out.insert(pos + 1, alias),
        None => out.push(alias),
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

fn hosts_has_alias(hosts: &str, hostname: &str) -> bool {
    hosts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some("127.0.1.1") && fields.any(|f| f == hostname)
    })
}

impl Resource for Hostname {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        let current = sys
            .read_file(&PathBuf::from(HOSTNAME_FILE))?
            .map(|b| String::from_utf8_lossy(&b).trim().to_string());
        if current.as_deref() != Some(self.name.as_str()) {
            return Ok(false);
        }
        let hosts = sys.read_file(&PathBuf::from(HOSTS_FILE))?.unwrap_or_default();
        Ok(hosts_has_alias(&String::from_utf8_lossy(&hosts), &self.name))
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        info!(hostname = %self.name, "Setting hostname");
        sys.write_file(
            &PathBuf::from(HOSTNAME_FILE),
            format!("{}\n", self.name).as_bytes(),
            &FilePerms::root(0o644),
        )?;

        let hosts = sys.read_file(&PathBuf::from(HOSTS_FILE))?.unwrap_or_default();
        let updated = hosts_with_hostname(&String::from_utf8_lossy(&hosts), &self.name);
        sys.write_file(
            &PathBuf::from(HOSTS_FILE),
            updated.as_bytes(),
            &FilePerms::root(0o644),
        )?;

        sys.run("hostname", &[self.name.as_str()])?;
        Ok(())
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        Ok(text_hash(&self.name))
    }
}

/// A kernel parameter, applied live and persisted under `/etc/sysctl.d`.
#[derive(Debug, Clone)]
pub struct Sysctl {
    key: String,
    value: String,
}

impl Sysctl {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Resource for Sysctl {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        let live = sys.run("sysctl", &["-n", self.key.as_str()])?;
        if live.trim() != self.value {
            return Ok(false);
        }
        let persisted = sys.read_file(&PathBuf::from(SYSCTL_FILE))?.unwrap_or_default();
        Ok(String::from_utf8_lossy(&persisted)
            .lines()
            .any(|l| l.trim() == format!("{} = {}", self.key, self.value)))
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        info!(key = %self.key, value = %self.value, "Setting kernel parameter");
        sys.write_file(
            &PathBuf::from(SYSCTL_FILE),
            format!("{} = {}\n", self.key, self.value).as_bytes(),
            &FilePerms::root(0o644),
        )?;
        let assignment = format!("{}={}", self.key, self.value);
        sys.run("sysctl", &["-w", assignment.as_str()])?;
        Ok(())
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        Ok(text_hash(&format!("{}={}", self.key, self.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeSystem;

    const DEBIAN_HOSTS: &str = "127.0.0.1\tlocalhost\n::1\t\tlocalhost ip6-localhost ip6-loopback\n\n127.0.1.1\traspberrypi\n";

    #[test]
    fn test_hosts_keeps_localhost_and_replaces_alias() {
        let out = hosts_with_hostname(DEBIAN_HOSTS, "sysohub");
        assert!(out.starts_with("127.0.0.1\tlocalhost\n127.0.1.1\tsysohub\n"));
        assert!(!out.contains("raspberrypi"));
        assert!(out.contains("ip6-localhost"));
    }

    #[test]
    fn test_hosts_rewrite_is_stable() {
        let once = hosts_with_hostname(DEBIAN_HOSTS, "sysohub");
        assert_eq!(hosts_with_hostname(&once, "sysohub"), once);
    }

    #[test]
    fn test_hostname_apply_then_check() {
        let sys = FakeSystem::default();
        sys.put_file(HOSTNAME_FILE, b"raspberrypi\n");
        sys.put_file(HOSTS_FILE, DEBIAN_HOSTS.as_bytes());
        let step = Hostname::new("sysohub");

        assert!(!step.check(&sys).unwrap());
        step.apply(&sys).unwrap();
        assert!(step.check(&sys).unwrap());
        assert!(sys.commands.borrow().contains(&"hostname sysohub".to_string()));
    }

    #[test]
    fn test_sysctl_requires_live_and_persisted_value() {
        let sys = FakeSystem::default();
        let step = Sysctl::new("net.ipv4.ip_forward", "1");
        sys.set_output("sysctl -n net.ipv4.ip_forward", "1");
        assert!(!step.check(&sys).unwrap());

        step.apply(&sys).unwrap();
        assert!(step.check(&sys).unwrap());
        assert!(sys
            .commands
            .borrow()
            .contains(&"sysctl -w net.ipv4.ip_forward=1".to_string()));
    }
}
