//! sysohub-flash - write a base OS image to an SD card and seed its boot
//! partition with the gateway configuration.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use sysohub::{ui, FlashError, HostMounter, HubConfig, Identity, ImageProvisioner};

/// Flash a gateway SD card.
#[derive(Parser)]
#[command(name = "sysohub-flash", version, about = "Flash and seed a sysohub SD card")]
struct Cli {
    /// Target block device (e.g. /dev/sdb or /dev/mmcblk0).
    device: Option<String>,

    /// Base OS image (default: `project.image.path` from the config).
    #[arg(long)]
    image: Option<PathBuf>,

    /// Configuration copied onto the boot partition.
    #[arg(long, env = "SYSOHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
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

    if cli.device.as_deref().map_or(true, |d| d.trim().is_empty()) {
        let _ = Cli::command().print_help();
        ui::print_error(&FlashError::MissingDevice.to_string());
        return ExitCode::from(2);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => path.clone(),
        None => Identity::resolve()?.default_config_path(),
    };
    let image = match &cli.image {
        Some(path) => path.clone(),
        None => {
            let loaded = HubConfig::load(&config)
                .with_context(|| format!("No --image given and {} is unusable", config.display()))?;
            loaded
                .image
                .path
                .context("No --image given and project.image.path is not set")?
        }
    };

    ui::print_section("Flashing SD card");
    ui::print_kv("Device", cli.device.as_deref().unwrap_or_default());
    ui::print_kv("Image", &image.display().to_string());
    ui::print_kv("Config", &config.display().to_string());

    let report =
        ImageProvisioner::new(HostMounter).provision(cli.device.as_deref(), &image, &config)?;

    ui::print_success(&format!(
        "Wrote {} MiB to {}",
        report.bytes_written / (1024 * 1024),
        report.device.display()
    ));
    for file in &report.injected {
        ui::print_list_item(&format!("{} on {}", file, report.partition.display()));
    }
    ui::print_info("Insert the card into the gateway and power it on");
    Ok(())
}
