//! Live health of the managed services.
//!
//! Every service gets a systemd activity check; services with a listener
//! also get a TCP or HTTP probe. Probes never mutate anything and one
//! unreachable service never stops the others from being checked.

use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{Deployment, DASHBOARD_PORT};
use crate::system::System;

/// Default per-probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How a service is reached beyond its unit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Unit state only.
    None,
    /// TCP connect to `127.0.0.1:<port>`.
    Tcp(u16),
    /// HTTP GET expecting a 2xx response.
    Http(String),
}

#[derive(Debug, Clone)]
pub struct ManagedService {
    pub name: String,
    pub unit: String,
    pub probe: Probe,
}

impl ManagedService {
    fn new(name: &str, unit: &str, probe: Probe) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            probe,
        }
    }
}

/// The services a deployment runs, with their probes.
#[must_use]
pub fn managed_services(deployment: &Deployment) -> Vec<ManagedService> {
    let config = &deployment.config;
    vec![
        ManagedService::new("Access point", "hostapd", Probe::None),
        ManagedService::new("DHCP/DNS", "dnsmasq", Probe::None),
        ManagedService::new("mDNS", "avahi-daemon", Probe::None),
        ManagedService::new("MQTT broker", "mosquitto", Probe::Tcp(config.mqtt.port)),
        ManagedService::new(
            "VictoriaMetrics",
            "victoria-metrics",
            Probe::Http(format!(
                "http://127.0.0.1:{}/health",
                config.victoria_metrics.port
            )),
        ),
        ManagedService::new("Node-RED", "nodered", Probe::Tcp(config.node_red.port)),
        ManagedService::new(
            "Dashboard",
            "sysohub-dashboard",
            Probe::Http(format!("http://127.0.0.1:{DASHBOARD_PORT}/")),
        ),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub unit: String,
    pub active: bool,
    /// Probe result; `None` when the service has no probe.
    pub reachable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostStats {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

impl HostStats {
    /// Sample CPU and memory usage. Blocks for the CPU sampling interval.
    #[must_use]
    pub fn sample() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            cpu_percent: sys.global_cpu_usage(),
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
        }
    }

    #[must_use]
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 * 100.0 / self.memory_total_bytes as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub healthy: bool,
    pub services: Vec<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostStats>,
}

/// Probes services against a host.
pub struct StatusReporter<'a> {
    sys: &'a dyn System,
    client: reqwest::Client,
    timeout: Duration,
}

impl<'a> StatusReporter<'a> {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(sys: &'a dyn System, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            sys,
            client,
            timeout,
        })
    }

    /// Check every service in order.
    pub async fn report(&self, services: &[ManagedService]) -> StatusReport {
        let mut statuses = Vec::with_capacity(services.len());
        for service in services {
            statuses.push(self.check(service).await);
        }
        StatusReport {
            healthy: statuses.iter().all(|s| s.healthy),
            services: statuses,
            host: None,
        }
    }

    /// Check one service.
    pub async fn check(&self, service: &ManagedService) -> ServiceStatus {
        let mut detail = None;
        let active = match self.sys.unit_active(&service.unit) {
            Ok(active) => active,
            Err(e) => {
                detail = Some(format!("unit state unknown: {e:#}"));
                false
            }
        };

        let reachable = match &service.probe {
            Probe::None => None,
            Probe::Tcp(port) => Some(self.probe_tcp(*port).await),
            Probe::Http(url) => Some(self.probe_http(url).await),
        };
        if reachable == Some(false) && detail.is_none() {
            detail = Some(match &service.probe {
                Probe::Tcp(port) => format!("port {port} not accepting connections"),
                Probe::Http(url) => format!("{url} not responding"),
                Probe::None => String::new(),
            });
        }

        debug!(unit = %service.unit, active, ?reachable, "Checked service");
        ServiceStatus {
            name: service.name.clone(),
            unit: service.unit.clone(),
            active,
            reachable,
            detail,
            healthy: active && reachable.unwrap_or(true),
        }
    }

    async fn probe_tcp(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }

    async fn probe_http(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "HTTP probe failed");
                false
            }
        }
    }
}
