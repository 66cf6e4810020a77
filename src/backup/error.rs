use std::path::PathBuf;
use thiserror::Error;

use super::LaneKind;

/// Failures the backup loop can run into.
///
/// Only [`BackupError::BinaryMissing`] and [`BackupError::AlreadyRunning`]
/// stop the process; everything else is logged and retried on the next poll.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("USB volume labelled {0:?} not found")]
    VolumeNotFound(String),

    #[error("filesystem {filesystem:?} on {} is not supported", mount_point.display())]
    FilesystemUnsupported {
        mount_point: PathBuf,
        filesystem: String,
    },

    #[error(
        "insufficient space on {}: {available} bytes free, {required} required",
        mount_point.display()
    )]
    InsufficientSpace {
        mount_point: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("failed to launch {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{lane} lane exited with {}", describe_exit(*code))]
    LaneExitNonZero { lane: LaneKind, code: Option<i32> },

    #[error("transfer binary {} is not installed", .0.display())]
    BinaryMissing(PathBuf),

    #[error("another instance holds {}{}", path.display(), pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::BinaryMissing(_) | BackupError::AlreadyRunning { .. }
        )
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(err: config::ConfigError) -> Self {
        BackupError::Config(err.to_string())
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}
