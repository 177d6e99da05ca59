//! Setup and update commands - run the provisioning orchestrator.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tracing::info;

use sysohub::steps::{restart_managed_units, upgrade_node_red, upgrade_os_packages};
use sysohub::{
    gateway_registry, ui, Deployment, HostSystem, Orchestrator, RunLock, RunReport, StateStore,
    StepOutcome, System, TemplateSet,
};

use super::{load_deployment, require_root};

/// Provision the gateway.
#[derive(Args)]
pub struct SetupCommand {
    /// Reboot once provisioning succeeds.
    #[arg(long)]
    reboot: bool,
}

impl SetupCommand {
    /// # Errors
    ///
    /// Returns an error if the caller is not root, the configuration is
    /// invalid, another run holds the lock, or a step fails.
    pub fn run(&self, config: Option<&Path>) -> Result<()> {
        require_root()?;
        let deployment = load_deployment(config)?;

        ui::print_banner();
        ui::print_section(&format!("Provisioning {}", deployment.config.name));
        let host = HostSystem::new();
        provision(&deployment, &host)?;
        ui::print_success("Gateway provisioned");

        if self.reboot {
            ui::print_info("Rebooting to apply network changes...");
            host.run("systemctl", &["reboot"])?;
        } else {
            ui::print_info("Reboot to bring up the access point on a fresh install");
        }
        Ok(())
    }
}

/// Re-apply configuration changes.
#[derive(Args)]
pub struct UpdateCommand {
    /// Upgrade OS packages and Node-RED, then restart managed services.
    #[arg(long)]
    upgrade: bool,
}

impl UpdateCommand {
    /// # Errors
    ///
    /// Returns an error if the caller is not root, the configuration is
    /// invalid, the package upgrade fails, or a step fails.
    pub fn run(&self, config: Option<&Path>) -> Result<()> {
        require_root()?;
        let deployment = load_deployment(config)?;
        let host = HostSystem::new();

        ui::print_section(&format!("Updating {}", deployment.config.name));
        if self.upgrade {
            ui::print_step("Upgrading OS packages");
            upgrade_os_packages(&host)?;
        }

        let report = provision(&deployment, &host)?;

        if self.upgrade {
            // npm is only guaranteed once provisioning has installed Node.js.
            ui::print_step("Upgrading Node-RED");
            upgrade_node_red(&host)?;

            ui::print_step("Restarting services");
            for (unit, result) in restart_managed_units(&host, &report) {
                match result {
                    Ok(()) => ui::print_check_result(unit, true, None),
                    Err(e) => ui::print_check_result(unit, false, Some(&format!("{e:#}"))),
                }
            }
        }

        ui::print_success("Gateway updated");
        Ok(())
    }
}

/// Run the orchestrator under the setup lock and print its report.
fn provision(deployment: &Deployment, host: &HostSystem) -> Result<RunReport> {
    let paths = &deployment.paths;
    let _lock = RunLock::acquire(&paths.lock_file)?;

    let templates = TemplateSet::load(&paths.templates_dir)?;
    let registry = gateway_registry(deployment, templates);
    let orchestrator = Orchestrator::new(StateStore::new(&paths.state_file));
    info!(state = %paths.state_file.display(), steps = registry.len(), "Running provisioning");

    let report = orchestrator.run_from_store::<dyn System>(&registry, host)?;
    print_summary(&report);
    Ok(report.into_result()?)
}

fn print_summary(report: &RunReport) {
    ui::print_section("Summary");
    ui::print_kv("Applied", &report.count(StepOutcome::Applied).to_string());
    ui::print_kv(
        "Drift corrected",
        &report.count(StepOutcome::DriftCorrected).to_string(),
    );
    ui::print_kv("Already satisfied", &report.count(StepOutcome::Verified).to_string());

    for step in &report.steps {
        match step.outcome {
            StepOutcome::Failed => ui::print_check_result(&step.description, false, Some("failed")),
            StepOutcome::NotAttempted => ui::print_list_item(&format!(
                "{} ({})",
                step.description, step.outcome
            )),
            _ => {}
        }
    }
    if let Some(failure) = &report.failure {
        ui::print_warning(&format!(
            "Run stopped: {failure}. Re-run to resume from the failed step."
        ));
    }
}
