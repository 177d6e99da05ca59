//! Device configuration types.
//!
//! `config.yml` is read once per run into a [`HubConfig`], validated, and
//! combined with the resolved invoking identity into a [`Deployment`] that
//! carries the single path set every other component consumes.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use nix::unistd::{geteuid, User};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};

/// Directory under the install dir holding tool-owned state.
pub const STATE_DIR_NAME: &str = ".sysohub";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    project: HubConfig,
}

/// Full device configuration (the `project` mapping of `config.yml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Device name, used in unit descriptions and the dashboard title.
    pub name: String,
    /// Hostname the gateway announces on the AP network.
    pub hostname: String,
    /// Wireless access point parameters.
    pub wifi: WifiConfig,
    /// Broker credentials and listener.
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub victoria_metrics: VictoriaMetricsConfig,
    #[serde(default)]
    pub node_red: NodeRedConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub image: ImageConfig,
    /// Optional overrides of the derived filesystem layout.
    #[serde(default)]
    pub paths: PathOverrides,
}

/// Access point configuration consumed by hostapd, dnsmasq and dhcpcd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub passphrase: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    #[serde(default = "default_dhcp_start")]
    pub dhcp_start: Ipv4Addr,
    #[serde(default = "default_dhcp_end")]
    pub dhcp_end: Ipv4Addr,
    #[serde(default = "default_lease_time")]
    pub lease_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictoriaMetricsConfig {
    #[serde(default = "default_vm_port")]
    pub port: u16,
    #[serde(default = "default_vm_version")]
    pub version: String,
    #[serde(default = "default_vm_arch")]
    pub arch: String,
    /// Retention in months, passed as `-retentionPeriod`.
    #[serde(default = "default_vm_retention")]
    pub retention_period: String,
}

impl Default for VictoriaMetricsConfig {
    fn default() -> Self {
        Self {
            port: default_vm_port(),
            version: default_vm_version(),
            arch: default_vm_arch(),
            retention_period: default_vm_retention(),
        }
    }
}

impl VictoriaMetricsConfig {
    /// Release tarball URL for the configured version and architecture.
    #[must_use]
    pub fn download_url(&self) -> String {
        format!(
            "https://github.com/VictoriaMetrics/VictoriaMetrics/releases/download/{v}/victoria-metrics-linux-{a}-{v}.tar.gz",
            v = self.version,
            a = self.arch
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRedConfig {
    #[serde(default = "default_node_red_port")]
    pub port: u16,
    #[serde(default = "default_node_red_heap")]
    pub max_old_space_mb: u32,
}

impl Default for NodeRedConfig {
    fn default() -> Self {
        Self {
            port: default_node_red_port(),
            max_old_space_mb: default_node_red_heap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Dashboard application to install. Defaults to
    /// `<install_dir>/templates/flask_app.py`.
    #[serde(default)]
    pub app_source: Option<PathBuf>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            app_source: None,
        }
    }
}

/// Port the bundled Flask dashboard binds; the app hardcodes it.
pub const DASHBOARD_PORT: u16 = 5000;

/// Backup naming and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_prefix")]
    pub prefix: String,
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            prefix: default_backup_prefix(),
            retention: default_retention(),
        }
    }
}

/// Base OS image used by `sysohub-flash`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathOverrides {
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

fn default_interface() -> String {
    "wlan0".into()
}
fn default_country() -> String {
    "US".into()
}
fn default_channel() -> u8 {
    7
}
fn default_address() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 4, 1)
}
fn default_prefix_len() -> u8 {
    24
}
fn default_dhcp_start() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 4, 2)
}
fn default_dhcp_end() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 4, 20)
}
fn default_lease_time() -> String {
    "24h".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_vm_port() -> u16 {
    8428
}
fn default_vm_version() -> String {
    "v1.115.0".into()
}
fn default_vm_arch() -> String {
    "arm64".into()
}
fn default_vm_retention() -> String {
    "12".into()
}
fn default_node_red_port() -> u16 {
    1880
}
fn default_node_red_heap() -> u32 {
    512
}
fn default_backup_prefix() -> String {
    "sysohub_backup".into()
}
fn default_retention() -> usize {
    5
}

impl HubConfig {
    /// Parse a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if the YAML is malformed or fails validation.
    pub fn from_yaml(content: &str) -> HubResult<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| HubError::config(format!("invalid config.yml: {e}")))?;
        file.project.validate()?;
        Ok(file.project)
    }

    /// Load and validate the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if the file is missing, unreadable or invalid.
    pub fn load(path: &Path) -> HubResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HubError::config(format!("cannot read {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_yaml(&content)
    }

    /// Check invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] describing the first violated rule.
    pub fn validate(&self) -> HubResult<()> {
        if self.name.trim().is_empty() {
            return Err(HubError::config("project.name must not be empty"));
        }
        validate_hostname(&self.hostname)?;

        let ssid_len = self.wifi.ssid.len();
        if !(1..=32).contains(&ssid_len) {
            return Err(HubError::config(format!(
                "wifi.ssid must be 1-32 bytes, got {ssid_len}"
            )));
        }
        let pass_len = self.wifi.passphrase.len();
        if !(8..=63).contains(&pass_len) {
            return Err(HubError::config(format!(
                "wifi.passphrase must be 8-63 characters for WPA2, got {pass_len}"
            )));
        }
        if !(1..=30).contains(&self.wifi.prefix_len) {
            return Err(HubError::config("wifi.prefix_len must be between 1 and 30"));
        }
        if u32::from(self.wifi.dhcp_start) > u32::from(self.wifi.dhcp_end) {
            return Err(HubError::config(
                "wifi.dhcp_start must not be after wifi.dhcp_end",
            ));
        }

        if self.mqtt.username.is_empty() || self.mqtt.username.contains(':') {
            return Err(HubError::config(
                "mqtt.username must be non-empty and must not contain ':'",
            ));
        }
        if self.mqtt.password.is_empty() {
            return Err(HubError::config("mqtt.password must not be empty"));
        }

        for (key, port) in [
            ("mqtt.port", self.mqtt.port),
            ("victoria_metrics.port", self.victoria_metrics.port),
            ("node_red.port", self.node_red.port),
        ] {
            if port == 0 {
                return Err(HubError::config(format!("{key} must not be 0")));
            }
        }

        if self.backup.retention == 0 {
            return Err(HubError::config("backup.retention must be at least 1"));
        }
        if self.backup.prefix.is_empty() || self.backup.prefix.contains('/') {
            return Err(HubError::config(
                "backup.prefix must be non-empty and must not contain '/'",
            ));
        }

        Ok(())
    }
}

fn validate_hostname(hostname: &str) -> HubResult<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 63
        && !hostname.starts_with('-')
        && !hostname.ends_with('-')
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(HubError::config(format!("invalid hostname: {hostname:?}")))
    }
}

/// The user the managed services run as, and their home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub home: PathBuf,
}

impl Identity {
    /// Resolve the invoking user from the process environment.
    ///
    /// Under `sudo` the services belong to `SUDO_USER`, not root. Otherwise
    /// the effective uid's passwd entry is used, so cron and systemd timers
    /// without `$USER` resolve the same way.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if no user or home directory can be found.
    pub fn resolve() -> HubResult<Self> {
        let euid = geteuid();
        let effective = match User::from_uid(euid) {
            Ok(entry) => entry.map(|u| Self {
                user: u.name,
                home: u.dir,
            }),
            Err(e) => {
                warn!(uid = euid.as_raw(), error = %e, "passwd lookup for effective uid failed");
                None
            }
        };
        Self::from_parts(
            std::env::var("SUDO_USER").ok().as_deref(),
            effective,
            std::env::var("USER").ok().as_deref(),
            dirs::home_dir(),
            passwd_home,
        )
    }

    /// Identity resolution over explicit inputs.
    ///
    /// Precedence: a non-root `sudo_user` (which must have a passwd entry),
    /// then the `effective` user's entry, then `env_user` with its passwd
    /// home or `home_fallback`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if no user or home directory can be found.
    pub fn from_parts(
        sudo_user: Option<&str>,
        effective: Option<Identity>,
        env_user: Option<&str>,
        home_fallback: Option<PathBuf>,
        home_of: impl Fn(&str) -> Option<PathBuf>,
    ) -> HubResult<Self> {
        if let Some(user) = sudo_user.filter(|u| !u.is_empty() && *u != "root") {
            // $HOME belongs to root under sudo, so only passwd is trusted.
            let home = home_of(user)
                .ok_or_else(|| HubError::config(format!("user {user} has no passwd entry")))?;
            return Ok(Self {
                user: user.to_string(),
                home,
            });
        }

        if let Some(identity) = effective {
            return Ok(identity);
        }

        let user = env_user
            .filter(|u| !u.is_empty())
            .ok_or_else(|| HubError::config("cannot determine invoking user"))?;
        let home = home_of(user).or(home_fallback).ok_or_else(|| {
            HubError::config(format!("cannot determine home directory for {user}"))
        })?;
        Ok(Self {
            user: user.to_string(),
            home,
        })
    }

    /// Default config file location for this identity.
    #[must_use]
    pub fn default_config_path(&self) -> PathBuf {
        self.home.join("sysohub").join("config").join("config.yml")
    }
}

/// Home directory of `user` from the passwd database.
#[must_use]
pub fn passwd_home(user: &str) -> Option<PathBuf> {
    match User::from_name(user) {
        Ok(entry) => entry.map(|u| u.dir),
        Err(e) => {
            warn!(user, error = %e, "passwd lookup failed");
            None
        }
    }
}

/// Every path the tool touches, derived once from identity and overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub install_dir: PathBuf,
    pub config_file: PathBuf,
    pub backup_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub templates_dir: PathBuf,
    pub node_red_dir: PathBuf,
    pub dashboard_app: PathBuf,
    pub dashboard_app_source: PathBuf,
}

impl ResolvedPaths {
    #[must_use]
    pub fn resolve(config: &HubConfig, identity: &Identity, config_file: &Path) -> Self {
        let install_dir = config
            .paths
            .install_dir
            .clone()
            .unwrap_or_else(|| identity.home.join("sysohub"));
        let state_dir = install_dir.join(STATE_DIR_NAME);
        let templates_dir = install_dir.join("templates");

        Self {
            config_file: config_file.to_path_buf(),
            backup_dir: config
                .paths
                .backup_dir
                .clone()
                .unwrap_or_else(|| identity.home.join("backups")),
            state_file: config
                .paths
                .state_file
                .clone()
                .unwrap_or_else(|| state_dir.join("setup-state.json")),
            lock_file: state_dir.join("setup.lock"),
            node_red_dir: identity.home.join(".node-red"),
            dashboard_app: install_dir.join("flask_app.py"),
            dashboard_app_source: config
                .dashboard
                .app_source
                .clone()
                .unwrap_or_else(|| templates_dir.join("flask_app.py")),
            templates_dir,
            install_dir,
        }
    }
}

/// A loaded configuration bound to its identity and resolved paths.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub config: HubConfig,
    pub identity: Identity,
    pub paths: ResolvedPaths,
}

impl Deployment {
    /// Resolve identity, locate and load the configuration.
    ///
    /// `explicit` wins over the default location under the user's home.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if identity or configuration cannot be resolved.
    pub fn load(explicit: Option<&Path>) -> HubResult<Self> {
        let identity = Identity::resolve()?;
        let config_file = explicit.map_or_else(|| identity.default_config_path(), Path::to_path_buf);
        if !config_file.exists() {
            return Err(HubError::config(format!(
                "config not found at {}",
                config_file.display()
            )));
        }
        let config = HubConfig::load(&config_file)?;
        Ok(Self::new(config, identity, &config_file))
    }

    #[must_use]
    pub fn new(config: HubConfig, identity: Identity, config_file: &Path) -> Self {
        let paths = ResolvedPaths::resolve(&config, &identity, config_file);
        Self {
            config,
            identity,
            paths,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r"
project:
  name: Plantomio X1
  hostname: sysohub
  wifi:
    ssid: sysohub-ap
    passphrase: changeme123
  mqtt:
    username: plantomioX1
    password: plantomioX1Pass
";

    pub(crate) fn sample_deployment(install_dir: &Path) -> Deployment {
        let mut config = HubConfig::from_yaml(SAMPLE).unwrap();
        config.paths.install_dir = Some(install_dir.to_path_buf());
        let identity = Identity {
            user: "pi".into(),
            home: PathBuf::from("/home/pi"),
        };
        Deployment::new(config, identity, &install_dir.join("config/config.yml"))
    }

    #[test]
    fn test_config_defaults() {
        let config = HubConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.wifi.interface, "wlan0");
        assert_eq!(config.wifi.address, Ipv4Addr::new(192, 168, 4, 1));
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.victoria_metrics.port, 8428);
        assert_eq!(config.node_red.port, 1880);
        assert_eq!(config.backup.prefix, "sysohub_backup");
        assert_eq!(config.backup.retention, 5);
    }

    #[test]
    fn test_missing_project_key_is_config_error() {
        let err = HubConfig::from_yaml("name: x\n").unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn test_short_passphrase_rejected() {
        let yaml = SAMPLE.replace("changeme123", "short");
        let err = HubConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("passphrase"));
    }

    #[test]
    fn test_invalid_hostname_rejected() {
        let yaml = SAMPLE.replace("hostname: sysohub", "hostname: bad_host");
        assert!(HubConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let yaml = format!("{SAMPLE}  backup:\n    retention: 0\n");
        let err = HubConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("retention"));
    }

    fn fake_passwd(user: &str) -> Option<PathBuf> {
        match user {
            "root" => Some(PathBuf::from("/root")),
            "pi" => Some(PathBuf::from("/home/pi")),
            _ => None,
        }
    }

    fn root_identity() -> Identity {
        Identity {
            user: "root".into(),
            home: PathBuf::from("/root"),
        }
    }

    #[test]
    fn test_identity_prefers_sudo_user() {
        let id = Identity::from_parts(
            Some("pi"),
            Some(root_identity()),
            Some("root"),
            Some("/root".into()),
            fake_passwd,
        )
        .unwrap();
        assert_eq!(id.user, "pi");
        assert_eq!(id.home, PathBuf::from("/home/pi"));
    }

    #[test]
    fn test_identity_ignores_root_sudo_user() {
        let id = Identity::from_parts(Some("root"), Some(root_identity()), None, None, fake_passwd)
            .unwrap();
        assert_eq!(id, root_identity());
    }

    #[test]
    fn test_identity_uses_effective_user_without_env() {
        // cron and systemd timers set neither SUDO_USER nor USER.
        let effective = Identity {
            user: "pi".into(),
            home: PathBuf::from("/home/pi"),
        };
        let id = Identity::from_parts(None, Some(effective.clone()), None, None, fake_passwd)
            .unwrap();
        assert_eq!(id, effective);
    }

    #[test]
    fn test_identity_falls_back_to_env_user_and_home() {
        let id = Identity::from_parts(None, None, Some("dev"), Some("/tmp/dev".into()), fake_passwd)
            .unwrap();
        assert_eq!(id.user, "dev");
        assert_eq!(id.home, PathBuf::from("/tmp/dev"));
    }

    #[test]
    fn test_identity_without_any_source_fails() {
        let err = Identity::from_parts(None, None, None, Some("/tmp".into()), fake_passwd)
            .unwrap_err();
        assert!(err.to_string().contains("cannot determine invoking user"));
    }

    #[test]
    fn test_identity_sudo_user_without_passwd_entry_fails() {
        let err = Identity::from_parts(
            Some("ghost"),
            Some(root_identity()),
            None,
            Some("/root".into()),
            fake_passwd,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_resolved_paths_layout() {
        let config = HubConfig::from_yaml(SAMPLE).unwrap();
        let identity = Identity {
            user: "pi".into(),
            home: PathBuf::from("/home/pi"),
        };
        let cfg_path = identity.default_config_path();
        let paths = ResolvedPaths::resolve(&config, &identity, &cfg_path);
        assert_eq!(paths.install_dir, PathBuf::from("/home/pi/sysohub"));
        assert_eq!(paths.backup_dir, PathBuf::from("/home/pi/backups"));
        assert_eq!(
            paths.state_file,
            PathBuf::from("/home/pi/sysohub/.sysohub/setup-state.json")
        );
        assert_eq!(
            paths.lock_file,
            PathBuf::from("/home/pi/sysohub/.sysohub/setup.lock")
        );
        assert_eq!(
            paths.config_file,
            PathBuf::from("/home/pi/sysohub/config/config.yml")
        );
        assert_eq!(
            paths.dashboard_app_source,
            PathBuf::from("/home/pi/sysohub/templates/flask_app.py")
        );
    }

    #[test]
    fn test_download_url() {
        let vm = VictoriaMetricsConfig::default();
        assert_eq!(
            vm.download_url(),
            "https://github.com/VictoriaMetrics/VictoriaMetrics/releases/download/v1.115.0/victoria-metrics-linux-arm64-v1.115.0.tar.gz"
        );
    }
}
