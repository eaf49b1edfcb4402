//! VM Runner
//!
//! Runs inside the VM's pod. Reads the rendered runner document, starts
//! the hypervisor with its companions and supervises it until the VM
//! stops. The exit code tells the operator how it ended.

mod agent;
mod command;
mod config;
mod display;
mod error;
mod process;
mod qmp;
mod state;
mod supervisor;

#[cfg(test)]
mod test_utils;

use crate::config::RunnerSettings;
use crate::state::Outcome;
use crate::supervisor::Supervisor;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting VM Runner");

    let settings = match RunnerSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(Outcome::StartFailed.exit_code());
        }
    };
    let config = match config::load_document(&settings.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(Outcome::StartFailed.exit_code());
        }
    };
    info!("Configuration:");
    info!("  Document: {}", settings.config_path.display());
    info!("  Hypervisor: {}", settings.qemu_binary);
    info!("  VM: {} ({} of {} vCPUs)", config.vm.name, config.vm.current_cpus, config.vm.maximum_cpus);

    let outcome = match Supervisor::new(settings, config).run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Supervisor failed: {}", e);
            Outcome::StartFailed
        }
    };
    std::process::exit(outcome.exit_code());
}
