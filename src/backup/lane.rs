use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::TransferCommand;
use super::error::BackupError;
use super::process::{ProcessHandle, ProcessStatus, Spawner};
use super::{LaneKind, LaneState};
use crate::utils::log_buffer::LogBuffer;

/// Upper bound on lines taken from one lane in a single pass.
const MAX_LINES_PER_DRAIN: usize = 1024;

/// Output lines kept for the crash report of a dead lane.
const TAIL_LINES: usize = 20;

/// Result of polling a lane once.
#[derive(Debug, Default)]
pub struct LanePoll {
    pub lines: Vec<String>,
    /// Set when the process was seen to exit during this poll.
    pub exit: Option<Option<i32>>,
}

/// One size-partitioned rclone instance and its lifecycle.
///
/// A lane owns at most one live process at any time.
pub struct Lane {
    command: TransferCommand,
    handle: Option<Box<dyn ProcessHandle>>,
    state: LaneState,
    last_restart: Option<Instant>,
    restarts: u32,
    tail: LogBuffer,
}

impl Lane {
    pub fn new(command: TransferCommand) -> Self {
        Self {
            command,
            handle: None,
            state: LaneState::Idle,
            last_restart: None,
            restarts: 0,
            tail: LogBuffer::new(TAIL_LINES),
        }
    }

    pub fn kind(&self) -> LaneKind {
        self.command.lane
    }

    pub fn command(&self) -> &TransferCommand {
        &self.command
    }

    pub fn state(&self) -> LaneState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_dead(&self) -> bool {
        self.state == LaneState::Dead
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn last_restart(&self) -> Option<Instant> {
        self.last_restart
    }

    /// Launch the lane's process. Refuses (returns `Ok`) if one is already live.
    pub fn spawn(&mut self, spawner: &mut dyn Spawner) -> Result<(), BackupError> {
        if self.handle.is_some() {
            debug!("{} lane already running, not spawning again", self.kind());
            return Ok(());
        }

        match spawner.spawn(&self.command) {
            Ok(handle) => {
                info!(
                    "Started {} lane (pid {})",
                    self.kind(),
                    handle
                        .id()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "?".to_string())
                );
                self.handle = Some(handle);
                self.state = LaneState::Running;
                self.tail.clear();
                Ok(())
            }
            Err(e) => {
                self.state = LaneState::Dead;
                Err(e)
            }
        }
    }

    /// Stop the process and hold the lane. Returns `false` if already paused.
    pub fn pause(&mut self) -> bool {
        if self.state == LaneState::Paused {
            return false;
        }
        if let Some(mut handle) = self.handle.take() {
            handle.terminate();
        }
        self.state = LaneState::Paused;
        true
    }

    /// Start a fresh process for a paused lane.
    pub fn resume(&mut self, spawner: &mut dyn Spawner) -> Result<(), BackupError> {
        if self.state != LaneState::Paused {
            return Ok(());
        }
        self.spawn(spawner)
    }

    /// Replace a dead process with a fresh one for the same command.
    pub fn restart(&mut self, spawner: &mut dyn Spawner, now: Instant) -> Result<(), BackupError> {
        if let Some(mut handle) = self.handle.take() {
            handle.terminate();
        }
        self.last_restart = Some(now);
        self.restarts += 1;
        self.spawn(spawner)
    }

    /// Drain available output and check for exit.
    ///
    /// Output is capped per call while the process runs. Once it has exited
    /// everything queued is drained, and the exit is only reported after
    /// both output streams have closed, so the last lines a process writes
    /// are never lost. The handle is then released and the lane becomes
    /// `Finished` or `Dead`.
    pub fn poll(&mut self) -> LanePoll {
        let Some(handle) = self.handle.as_mut() else {
            return LanePoll::default();
        };

        let status = handle.poll();
        let limit = match status {
            ProcessStatus::Running => MAX_LINES_PER_DRAIN,
            ProcessStatus::Exited(_) => usize::MAX,
        };
        let mut lines = Vec::new();
        while lines.len() < limit {
            match handle.read_line() {
                Some(line) => lines.push(line),
                None => break,
            }
        }
        let closed = handle.output_closed();

        for line in &lines {
            info!(lane = %self.command.lane, "{}", line);
            self.tail.push(line);
        }

        let exit = match status {
            ProcessStatus::Running => None,
            // forwarders still flushing; report the exit on a later pass
            ProcessStatus::Exited(_) if !closed => None,
            ProcessStatus::Exited(code) => {
                self.handle = None;
                if status.is_success() {
                    self.state = LaneState::Finished;
                } else {
                    self.state = LaneState::Dead;
                    if !self.tail.is_empty() {
                        warn!(
                            "Last output of {} lane before exit:\n{}",
                            self.kind(),
                            self.tail.render()
                        );
                    }
                }
                Some(code)
            }
        };

        LanePoll { lines, exit }
    }
}
