//! Backup command - archive the install directory and apply retention.

use std::path::Path;

use anyhow::Result;
use clap::Args;

use sysohub::{ui, BackupRotator};

use super::load_deployment;

/// Archive the install directory and prune old archives.
#[derive(Args)]
pub struct BackupCommand {
    /// Skip archive creation and only apply the retention policy.
    #[arg(long)]
    prune_only: bool,

    /// Output results as JSON.
    #[arg(long)]
    json: bool,
}

impl BackupCommand {
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or the archive
    /// cannot be written.
    pub fn run(&self, config: Option<&Path>) -> Result<()> {
        let deployment = load_deployment(config)?;
        let rotator = BackupRotator::from_deployment(&deployment)?;
        let outcome = rotator.run(self.prune_only)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            ui::print_section("Backup");
            ui::print_kv("Directory", &rotator.backup_dir().display().to_string());
            if let Some(created) = &outcome.created {
                ui::print_success(&format!(
                    "Created {} ({} bytes)",
                    created.path.display(),
                    created.size_bytes
                ));
            }
            ui::print_kv(
                "Retained",
                &format!(
                    "{} (keeping {})",
                    outcome.rotation.kept.len(),
                    deployment.config.backup.retention
                ),
            );
            for path in &outcome.rotation.deleted {
                ui::print_list_item(&format!("removed {}", path.display()));
            }
            for path in &outcome.rotation.failed {
                ui::print_check_result(&path.display().to_string(), false, Some("could not delete"));
            }
        }

        if !outcome.rotation.failed.is_empty() && !self.json {
            ui::print_warning(&format!(
                "{} expired backup(s) could not be deleted",
                outcome.rotation.failed.len()
            ));
        }
        Ok(())
    }
}
