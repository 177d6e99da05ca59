//! Configuration file templates.
//!
//! Defaults are compiled into the binary. A `<name>.hbs` file in the install
//! directory's `templates/` folder replaces the embedded version of the same
//! name.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::Deployment;
use crate::error::{HubError, HubResult};

pub const DHCPCD: &str = "dhcpcd.conf";
pub const HOSTAPD: &str = "hostapd.conf";
pub const DNSMASQ: &str = "dnsmasq.conf";
pub const MOSQUITTO: &str = "mosquitto.conf";
pub const VM_SCRAPE: &str = "victoria-metrics.yml";
pub const VM_UNIT: &str = "victoria-metrics.service";
pub const NODE_RED_SETTINGS: &str = "node_red_settings.js";
pub const NODE_RED_UNIT: &str = "nodered.service";
pub const DASHBOARD_UNIT: &str = "sysohub-dashboard.service";

/// Installed VictoriaMetrics binary.
pub const VM_BINARY: &str = "/usr/local/bin/victoria-metrics";
/// VictoriaMetrics storage directory.
pub const VM_DATA_DIR: &str = "/var/lib/victoria-metrics";
/// VictoriaMetrics scrape configuration.
pub const VM_SCRAPE_CONFIG: &str = "/etc/victoria-metrics.yml";

const EMBEDDED: &[(&str, &str)] = &[
    (DHCPCD, include_str!("../templates/dhcpcd.conf.hbs")),
    (HOSTAPD, include_str!("../templates/hostapd.conf.hbs")),
    (DNSMASQ, include_str!("../templates/dnsmasq.conf.hbs")),
    (MOSQUITTO, include_str!("../templates/mosquitto.conf.hbs")),
    (VM_SCRAPE, include_str!("../templates/victoria-metrics.yml.hbs")),
    (VM_UNIT, include_str!("../templates/victoria-metrics.service.hbs")),
    (
        NODE_RED_SETTINGS,
        include_str!("../templates/node_red_settings.js.hbs"),
    ),
    (NODE_RED_UNIT, include_str!("../templates/nodered.service.hbs")),
    (
        DASHBOARD_UNIT,
        include_str!("../templates/sysohub-dashboard.service.hbs"),
    ),
];

/// Registered templates, embedded defaults plus any overrides.
pub struct TemplateSet {
    handlebars: Handlebars<'static>,
}

impl TemplateSet {
    /// Templates compiled into the binary.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if an embedded template fails to parse.
    pub fn embedded() -> HubResult<Self> {
        let mut handlebars = Handlebars::new();
        // Output is config files, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);

        for (name, source) in EMBEDDED {
            handlebars
                .register_template_string(name, *source)
                .map_err(|e| HubError::config(format!("template {name}: {e}")))?;
        }
        Ok(Self { handlebars })
    }

    /// Embedded templates with `<dir>/<name>.hbs` overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if an override cannot be read or parsed.
    pub fn load(dir: &Path) -> HubResult<Self> {
        let mut set = Self::embedded()?;
        for (name, _) in EMBEDDED {
            let path = dir.join(format!("{name}.hbs"));
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|e| HubError::config(format!("cannot read {}: {e}", path.display())))?;
            set.handlebars
                .register_template_string(name, content)
                .map_err(|e| HubError::config(format!("template {}: {e}", path.display())))?;
            info!(template = name, path = %path.display(), "Using template override");
        }
        Ok(set)
    }

    /// Render a template with the given data.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is unknown or references missing data.
    pub fn render<T: Serialize>(&self, template: &str, data: &T) -> Result<String> {
        debug!(template, "Rendering template");
        self.handlebars
            .render(template, data)
            .with_context(|| format!("Failed to render template {template}"))
    }
}

/// Dotted netmask for a prefix length in `1..=32`.
#[must_use]
pub fn netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(prefix_len.min(32));
    if bits == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(u32::MAX << (32 - bits))
}

/// Data every template renders against.
///
/// `node_red.node` and `node_red.binary` are filled with defaults here and
/// replaced with resolved paths when the unit file is rendered.
#[must_use]
pub fn render_context(deployment: &Deployment) -> Value {
    let config = &deployment.config;
    let paths = &deployment.paths;
    let wifi = &config.wifi;
    json!({
        "name": config.name,
        "hostname": config.hostname,
        "user": deployment.identity.user,
        "home": deployment.identity.home,
        "install_dir": paths.install_dir,
        "wifi": {
            "interface": wifi.interface,
            "ssid": wifi.ssid,
            "passphrase": wifi.passphrase,
            "country": wifi.country,
            "channel": wifi.channel,
            "address": wifi.address.to_string(),
            "prefix_len": wifi.prefix_len,
            "netmask": netmask(wifi.prefix_len).to_string(),
            "dhcp_start": wifi.dhcp_start.to_string(),
            "dhcp_end": wifi.dhcp_end.to_string(),
            "lease_time": wifi.lease_time,
        },
        "mqtt": {
            "port": config.mqtt.port,
        },
        "vm": {
            "port": config.victoria_metrics.port,
            "binary": VM_BINARY,
            "data_dir": VM_DATA_DIR,
            "scrape_config": VM_SCRAPE_CONFIG,
            "retention_period": config.victoria_metrics.retention_period,
        },
        "node_red": {
            "port": config.node_red.port,
            "dir": paths.node_red_dir,
            "max_old_space_mb": config.node_red.max_old_space_mb,
            "node": "/usr/bin/node",
            "binary": "/usr/local/bin/node-red",
        },
        "dashboard": {
            "app": paths.dashboard_app,
        },
    })
}
