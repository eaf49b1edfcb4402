//! VM Operator
//!
//! Reconciles `VirtualMachine` resources into runner pods and their
//! companion objects, hands out pooled VMs to users and keeps the display
//! credentials used by console clients fresh.

mod backoff;
mod channel;
mod config;
mod console;
mod controller;
mod display_secret;
mod error;
mod hashing;
mod metrics;
mod pool;
mod reconciler;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use controller::Controller;
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting VM Operator");

    let config = OperatorConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Runner image: {}", config.runner_image);
    info!("  Metrics: {}", config.metrics_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
