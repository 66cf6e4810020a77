use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

mod backup;
mod utils;

use crate::backup::process::{check_rclone, RcloneSpawner};
use crate::backup::CycleDriver;
use crate::utils::disk::MountedVolumeLocator;
use crate::utils::lock::InstanceLock;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = utils::config::load_config().context("loading configuration")?;
    utils::logging::init_tracing(&config.log_file, config.log_json)?;

    info!("Starting cloud2usb v{}", env!("CARGO_PKG_VERSION"));

    let _lock = match InstanceLock::acquire(&config.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    match check_rclone(&config.rclone_path).await {
        Ok(version) => info!("Using {}", version),
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    }

    let spawner = RcloneSpawner::new(config.kill_grace);
    let mut driver = CycleDriver::new(Arc::new(config), MountedVolumeLocator::new(), spawner);

    // Dropping the driver mid-cycle kills both rclone processes
    tokio::select! {
        _ = driver.run() => {},
        _ = shutdown_signal() => {},
    }

    info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
