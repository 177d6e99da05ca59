//! sysohub gateway provisioning library.
//!
//! Turns a Raspberry Pi into an IoT gateway (Wi-Fi access point, MQTT broker,
//! time-series store, flow editor and dashboard) through an idempotent,
//! resumable step orchestrator. Also provides archive rotation for the install
//! directory, SD card image provisioning and a live service status report.
//!
//! # Example
//!
//! ```ignore
//! use sysohub::{gateway_registry, Deployment, HostSystem, Orchestrator, StateStore, System, TemplateSet};
//!
//! fn main() -> anyhow::Result<()> {
//!     let deployment = Deployment::load(None)?;
//!     let templates = TemplateSet::load(&deployment.paths.templates_dir)?;
//!     let registry = gateway_registry(&deployment, templates);
//!     let orchestrator = Orchestrator::new(StateStore::new(&deployment.paths.state_file));
//!     orchestrator
//!         .run_from_store::<dyn System>(&registry, &HostSystem)?
//!         .into_result()?;
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

pub mod backup;
pub mod config;
pub mod error;
pub mod flash;
pub mod lock;
pub mod orchestrator;
pub mod state;
pub mod status;
pub mod step;
pub mod steps;
pub mod system;
pub mod templates;
pub mod ui;

pub use backup::{BackupRecord, BackupRotator, RetentionPolicy, RotationSummary};
pub use config::{Deployment, HubConfig, Identity, ResolvedPaths};
pub use error::{FlashError, HubError, HubResult};
pub use flash::{HostMounter, ImageProvisioner, Mounter};
pub use lock::RunLock;
pub use orchestrator::{Orchestrator, RunReport, StepOutcome, StepReport};
pub use state::{CompletionRecord, SetupState, StateStore};
pub use status::{StatusReport, StatusReporter};
pub use step::{FnStep, Step, StepRegistry};
pub use steps::gateway_registry;
pub use system::{HostSystem, System};
pub use templates::TemplateSet;
