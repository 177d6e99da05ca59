//! sysohub CLI.
//!
//! Provisions a Raspberry Pi as an IoT gateway, keeps it up to date, backs up
//! the install directory and reports service health.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sysohub::ui;

mod commands;

use commands::backup::BackupCommand;
use commands::setup::{SetupCommand, UpdateCommand};
use commands::status::StatusCommand;

/// sysohub - IoT gateway provisioning.
#[derive(Parser)]
#[command(
    name = "sysohub",
    version,
    about = "Provision and maintain a sysohub IoT gateway",
    long_about = "Provision a Raspberry Pi as an IoT gateway.\n\n\
                  Sets up a Wi-Fi access point, Mosquitto, VictoriaMetrics,\n\
                  Node-RED and the sysohub dashboard.\n\n\
                  All operations are idempotent - re-running the same command\n\
                  only applies what is missing or changed."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to config.yml (default: ~/sysohub/config/config.yml).
    #[arg(long, global = true, env = "SYSOHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the gateway.
    ///
    /// Runs every provisioning step that is not already satisfied and
    /// records progress so an interrupted run resumes where it stopped.
    Setup(SetupCommand),

    /// Re-apply the configuration, optionally upgrading OS packages first.
    Update(UpdateCommand),

    /// Archive the install directory and prune old archives.
    Backup(BackupCommand),

    /// Report the health of every managed service.
    Status(StatusCommand),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,sysohub=debug"
    } else {
        "warn,sysohub=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    let result = match &cli.command {
        Commands::Setup(cmd) => cmd.run(config),
        Commands::Update(cmd) => cmd.run(config),
        Commands::Backup(cmd) => cmd.run(config),
        Commands::Status(cmd) => cmd.run(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
