use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};
use tracing::{debug, warn};

use crate::backup::BackupError;

/// Held for the lifetime of the process so two instances never write to the
/// same drive. The lock file holds the owner's PID and is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, BackupError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // one retry after reclaiming a stale lock
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    debug!("Acquired instance lock {}", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = read_owner(path);
                    if let Some(pid) = owner.filter(|pid| process_alive(*pid)) {
                        return Err(BackupError::AlreadyRunning {
                            path: path.to_path_buf(),
                            pid: Some(pid),
                        });
                    }
                    warn!(
                        "Removing stale lock {} (owner {})",
                        path.display(),
                        owner.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
                    );
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BackupError::AlreadyRunning {
            path: path.to_path_buf(),
            pid: read_owner(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove lock {}: {}", self.path.display(), e);
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}
