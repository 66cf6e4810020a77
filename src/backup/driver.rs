use anyhow::Result;
use chrono::{Datelike, Local};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::command::{plan_lanes, TransferMode};
use super::error::BackupError;
use super::process::Spawner;
use super::supervisor::{CycleReport, Supervisor, ThrottlePolicy};
use crate::utils::config::Config;
use crate::utils::disk::VolumeLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Detecting,
    CycleRunning,
}

#[derive(Debug)]
pub enum PollOutcome {
    VolumeAbsent,
    /// The volume is there but cannot take a backup right now.
    Skipped(BackupError),
    Completed(CycleReport),
}

/// Waits for the backup volume and runs one supervised cycle per poll that
/// finds it.
pub struct CycleDriver<L, S> {
    config: Arc<Config>,
    locator: L,
    spawner: S,
    state: DriverState,
}

impl<L, S> CycleDriver<L, S>
where
    L: VolumeLocator,
    S: Spawner,
{
    pub fn new(config: Arc<Config>, locator: L, spawner: S) -> Self {
        Self {
            config,
            locator,
            spawner,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Poll forever, sleeping `check_interval` after every attempt.
    pub async fn run(&mut self) {
        info!(
            "Watching for USB volume {:?} every {}",
            self.config.usb_label,
            humantime::format_duration(self.config.check_interval())
        );

        loop {
            match self.poll_once().await {
                Ok(PollOutcome::VolumeAbsent) => {}
                Ok(PollOutcome::Skipped(reason)) => warn!("Skipping backup: {}", reason),
                Ok(PollOutcome::Completed(report)) => {
                    debug!("Cycle {} produced {} events", report.id, report.events.len())
                }
                Err(e) => warn!("Volume check failed: {:#}", e),
            }
            self.state = DriverState::Idle;
            sleep(self.config.check_interval()).await;
        }
    }

    /// One detection attempt, running a full cycle if the volume is usable.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        self.state = DriverState::Detecting;
        let config = Arc::clone(&self.config);

        let Some(volume) = self.locator.find_by_label(&config.usb_label).await? else {
            debug!("{}", BackupError::VolumeNotFound(config.usb_label.clone()));
            self.state = DriverState::Idle;
            return Ok(PollOutcome::VolumeAbsent);
        };
        info!("Found {} at {}", volume.label, volume.mount_point.display());

        let filesystem = self.locator.filesystem_type(&volume).await?;
        if !filesystem.is_supported() {
            self.state = DriverState::Idle;
            return Ok(PollOutcome::Skipped(BackupError::FilesystemUnsupported {
                mount_point: volume.mount_point,
                filesystem: filesystem.name().to_string(),
            }));
        }

        let available = self.locator.free_space(&volume).await?;
        if available < config.min_free_space {
            self.state = DriverState::Idle;
            return Ok(PollOutcome::Skipped(BackupError::InsufficientSpace {
                mount_point: volume.mount_point,
                available,
                required: config.min_free_space,
            }));
        }

        let destination = volume.mount_point.join(&config.usb_folder);
        if let Err(e) = tokio::fs::create_dir_all(&destination).await {
            self.state = DriverState::Idle;
            return Ok(PollOutcome::Skipped(e.into()));
        }

        let mode = TransferMode::for_day(Local::now().weekday(), config.sync_day);
        info!(
            "Starting {} of {} to {} ({} filesystem)",
            mode.as_arg(),
            config.remote,
            destination.display(),
            filesystem.name()
        );

        let (large, small) = plan_lanes(&config, &destination, mode, &filesystem);
        self.state = DriverState::CycleRunning;
        let report = Supervisor::new(
            &mut self.spawner,
            ThrottlePolicy::from_config(&config),
            large,
            small,
        )
        .run()
        .await;
        self.state = DriverState::Idle;

        info!("Backup to {} complete", destination.display());
        Ok(PollOutcome::Completed(report))
    }
}
