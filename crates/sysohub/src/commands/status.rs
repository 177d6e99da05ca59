//! Status command - live health of every managed service.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::warn;

use sysohub::status::{managed_services, HostStats, PROBE_TIMEOUT};
use sysohub::{ui, HostSystem, StatusReport, StatusReporter};

use super::load_deployment;

/// Report the health of every managed service.
#[derive(Args)]
pub struct StatusCommand {
    /// Output results as JSON.
    #[arg(long)]
    json: bool,
}

impl StatusCommand {
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or any
    /// service is unhealthy.
    pub fn run(&self, config: Option<&Path>) -> Result<()> {
        let deployment = load_deployment(config)?;
        let services = managed_services(&deployment);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;

        let host = HostSystem::new();
        let report = runtime.block_on(async {
            let reporter = StatusReporter::new(&host, PROBE_TIMEOUT)?;
            let stats = tokio::task::spawn_blocking(HostStats::sample);
            let mut report = reporter.report(&services).await;
            match stats.await {
                Ok(stats) => report.host = Some(stats),
                Err(e) => warn!(error = %e, "Failed to sample host stats"),
            }
            anyhow::Ok(report)
        })?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&deployment.config.name, &report);
        }

        if !report.healthy {
            let down: Vec<&str> = report
                .services
                .iter()
                .filter(|s| !s.healthy)
                .map(|s| s.unit.as_str())
                .collect();
            bail!("Unhealthy services: {}", down.join(", "));
        }
        Ok(())
    }
}

fn print_report(name: &str, report: &StatusReport) {
    ui::print_section(&format!("{name} status"));
    for service in &report.services {
        let state = if service.active {
            "active".green()
        } else {
            "inactive".red()
        };
        let label = format!("{:<16} {:<20} {state}", service.name, service.unit);
        ui::print_check_result(&label, service.healthy, service.detail.as_deref());
    }

    if let Some(host) = &report.host {
        println!();
        ui::print_kv("CPU", &format!("{:.1}%", host.cpu_percent));
        ui::print_kv(
            "Memory",
            &format!(
                "{:.1}% ({} / {} MiB)",
                host.memory_percent(),
                host.memory_used_bytes / (1024 * 1024),
                host.memory_total_bytes / (1024 * 1024)
            ),
        );
    }

    println!();
    if report.healthy {
        ui::print_success("All services healthy");
    } else {
        ui::print_warning("Some services are not healthy");
    }
}
