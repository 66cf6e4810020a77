pub mod classifier;
pub mod command;
pub mod driver;
pub mod error;
pub mod lane;
pub mod process;
pub mod supervisor;

pub use driver::CycleDriver;
pub use error::BackupError;

use std::fmt;

/// Which half of the size partition a lane transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    Large,
    Small,
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneKind::Large => f.write_str("large"),
            LaneKind::Small => f.write_str("small"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    /// Never spawned.
    Idle,
    Running,
    Paused,
    /// Exited unexpectedly or failed to spawn; restarted on the next pass.
    Dead,
    /// Exited cleanly.
    Finished,
}
