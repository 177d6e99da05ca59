//! In-place upgrades run by `update --upgrade`.
//!
//! The provisioning steps only check that software is present, so upgrades
//! are explicit actions outside the orchestrator.

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::gateway::{MANAGED_UNITS, NODE_RED_PACKAGE, NODE_RED_PROGRAM};
use super::{NpmGlobal, Resource};
use crate::orchestrator::RunReport;
use crate::system::System;

/// Refresh the package index and upgrade installed OS packages, keeping
/// locally modified config files.
///
/// # Errors
///
/// Returns an error if apt fails.
pub fn upgrade_os_packages(sys: &dyn System) -> Result<()> {
    info!("Upgrading OS packages");
    sys.run("apt-get", &["update"])
        .context("Package index refresh failed")?;
    sys.run(
        "apt-get",
        &[
            "-y",
            "-o",
            "Dpkg::Options::=--force-confdef",
            "-o",
            "Dpkg::Options::=--force-confold",
            "upgrade",
        ],
    )
    .context("Package upgrade failed")?;
    Ok(())
}

/// Reinstall Node-RED from npm to pick up the latest release.
///
/// # Errors
///
/// Returns an error if npm fails.
pub fn upgrade_node_red(sys: &dyn System) -> Result<()> {
    NpmGlobal::new(NODE_RED_PACKAGE, NODE_RED_PROGRAM)
        .apply(sys)
        .context("Node-RED upgrade failed")
}

/// Restart every managed unit the run did not already restart.
///
/// Failures are logged and returned per unit; one failing unit does not
/// stop the others.
pub fn restart_managed_units(
    sys: &dyn System,
    report: &RunReport,
) -> Vec<(&'static str, Result<()>)> {
    MANAGED_UNITS
        .iter()
        .filter(|unit| {
            report
                .outcome_of(&format!("svc.{unit}"))
                .map_or(true, |outcome| !outcome.applied())
        })
        .map(|&unit| {
            let result = sys.restart_unit(unit);
            if let Err(e) = &result {
                warn!(unit, error = %e, "Failed to restart service");
            }
            (unit, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{StepOutcome, StepReport};
    use crate::state::SetupState;
    use crate::system::fake::FakeSystem;

    fn report(applied_units: &[&str]) -> RunReport {
        RunReport {
            steps: MANAGED_UNITS
                .iter()
                .map(|unit| StepReport {
                    id: format!("svc.{unit}"),
                    description: format!("Start {unit}"),
                    outcome: if applied_units.contains(unit) {
                        StepOutcome::Applied
                    } else {
                        StepOutcome::Verified
                    },
                })
                .collect(),
            state: SetupState::new(),
            failure: None,
        }
    }

    #[test]
    fn test_node_red_is_reinstalled_even_when_present() {
        let sys = FakeSystem::default();
        sys.programs
            .borrow_mut()
            .insert("node-red".into(), "/usr/local/bin/node-red".into());

        upgrade_node_red(&sys).unwrap();
        assert_eq!(
            *sys.commands.borrow(),
            vec!["npm install -g --unsafe-perm node-red"]
        );
    }

    #[test]
    fn test_os_upgrade_refreshes_index_first() {
        let sys = FakeSystem::default();
        upgrade_os_packages(&sys).unwrap();
        let commands = sys.commands.borrow();
        assert_eq!(commands[0], "apt-get update");
        assert!(commands[1].starts_with("apt-get -y"));
        assert!(commands[1].contains("--force-confold"));
        assert!(commands[1].ends_with("upgrade"));
    }

    #[test]
    fn test_os_upgrade_failure_is_reported() {
        let sys = FakeSystem::default();
        sys.fail_commands.borrow_mut().insert("apt-get".into());
        let err = upgrade_os_packages(&sys).unwrap_err();
        assert!(format!("{err:#}").contains("Package index refresh failed"));
    }

    #[test]
    fn test_restart_skips_units_the_run_restarted() {
        let sys = FakeSystem::default();
        let results = restart_managed_units(&sys, &report(&["mosquitto"]));

        assert_eq!(results.len(), MANAGED_UNITS.len() - 1);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        let restarted = sys.restarts.borrow();
        assert!(!restarted.contains(&"mosquitto".to_string()));
        assert!(restarted.contains(&"nodered".to_string()));
    }
}
