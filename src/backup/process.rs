use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid, Signal, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, warn};

use super::command::TransferCommand;
use super::error::BackupError;
use super::LaneKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// `None` when the process was killed by a signal.
    Exited(Option<i32>),
}

impl ProcessStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessStatus::Exited(Some(0)))
    }
}

/// A launched transfer process with its merged stdout/stderr.
///
/// Every method returns immediately; nothing here may hold up the
/// supervisor's polling loop.
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    fn poll(&mut self) -> ProcessStatus;

    /// Next buffered output line, if one is available right now.
    fn read_line(&mut self) -> Option<String>;

    /// True once both output streams have ended and every line was read.
    fn output_closed(&self) -> bool;

    /// Ask the process to stop. Idempotent; a no-op once it has exited.
    fn terminate(&mut self);
}

/// Launches processes for lanes. The seam the supervisor is tested through.
pub trait Spawner: Send {
    fn spawn(&mut self, command: &TransferCommand) -> Result<Box<dyn ProcessHandle>, BackupError>;
}

/// Spawns real rclone processes.
#[derive(Debug, Clone)]
pub struct RcloneSpawner {
    kill_grace: Duration,
}

impl RcloneSpawner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl Spawner for RcloneSpawner {
    fn spawn(&mut self, command: &TransferCommand) -> Result<Box<dyn ProcessHandle>, BackupError> {
        let process = ChildProcess::start(command, self.kill_grace)?;
        Ok(Box::new(process))
    }
}

pub struct ChildProcess {
    lane: LaneKind,
    child: Option<Child>,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
    closed: bool,
    exit: Option<Option<i32>>,
    kill_grace: Duration,
}

impl ChildProcess {
    pub fn start(command: &TransferCommand, kill_grace: Duration) -> Result<Self, BackupError> {
        debug!("Running transfer command: {}", command.display());

        let mut child = Command::new(&command.program)
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackupError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        // Both streams feed one queue; order within each stream is kept
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Self {
            lane: command.lane,
            pid: child.id(),
            child: Some(child),
            lines: rx,
            closed: false,
            exit: None,
            kill_grace,
        })
    }
}

impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn poll(&mut self) -> ProcessStatus {
        if let Some(code) = self.exit {
            return ProcessStatus::Exited(code);
        }
        let Some(child) = self.child.as_mut() else {
            return ProcessStatus::Exited(None);
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status.code());
                ProcessStatus::Exited(status.code())
            }
            Ok(None) => ProcessStatus::Running,
            Err(e) => {
                warn!("Could not poll {} lane process: {}", self.lane, e);
                ProcessStatus::Running
            }
        }
    }

    fn read_line(&mut self) -> Option<String> {
        match self.lines.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) => None,
            // both forwarders are done
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }

    fn output_closed(&self) -> bool {
        self.closed
    }

    fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            self.exit = Some(status.code());
            return;
        }
        self.exit = Some(None);

        request_stop(&mut child);

        // Reap in the background; force-kill if the grace period runs out
        let lane = self.lane;
        let grace = self.kill_grace;
        tokio::spawn(async move {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!("{} lane process stopped: {}", lane, status),
                Ok(Err(e)) => warn!("Error waiting for {} lane process: {}", lane, e),
                Err(_) => {
                    warn!(
                        "{} lane process ignored termination for {}, killing it",
                        lane,
                        humantime::format_duration(grace)
                    );
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill {} lane process: {}", lane, e);
                    }
                }
            }
        });
    }
}

/// SIGTERM where the platform has it, otherwise an immediate kill.
fn request_stop(child: &mut Child) {
    if let Some(pid) = child.id().map(Pid::from_u32) {
        let mut system = System::new();
        let sent = system.refresh_process(pid)
            && system
                .process(pid)
                .and_then(|process| process.kill_with(Signal::Term))
                .unwrap_or(false);
        if sent {
            return;
        }
    }
    let _ = child.start_kill();
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading transfer output: {}", e);
                break;
            }
        }
    }
}

/// Check that rclone can be launched at all and return its version line.
pub async fn check_rclone(program: &Path) -> Result<String> {
    let output = match Command::new(program).arg("version").output().await {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackupError::BinaryMissing(program.to_path_buf()).into());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to execute {}", program.display()));
        }
    };

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "{} version exited with {}",
            program.display(),
            output.status
        ));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or("unknown").to_string())
}

#[cfg(test)]
pub mod testing {
    //! Scriptable processes for exercising lanes and the supervisor.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub lines: VecDeque<String>,
        pub exit: Option<i32>,
        pub terminations: u32,
    }

    pub struct FakeProcess {
        state: Arc<Mutex<FakeState>>,
    }

    impl ProcessHandle for FakeProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn poll(&mut self) -> ProcessStatus {
            match self.state.lock().exit {
                Some(code) => ProcessStatus::Exited(Some(code)),
                None => ProcessStatus::Running,
            }
        }

        fn read_line(&mut self) -> Option<String> {
            self.state.lock().lines.pop_front()
        }

        fn output_closed(&self) -> bool {
            let state = self.state.lock();
            state.exit.is_some() && state.lines.is_empty()
        }

        fn terminate(&mut self) {
            self.state.lock().terminations += 1;
        }
    }

    #[derive(Default)]
    struct Inner {
        spawned: Vec<(LaneKind, TransferCommand, Arc<Mutex<FakeState>>)>,
        scripts: HashMap<LaneKind, VecDeque<FakeState>>,
        failures: HashMap<LaneKind, u32>,
    }

    /// Clones share state, so a test can keep one while the supervisor
    /// borrows another.
    #[derive(Clone, Default)]
    pub struct FakeSpawner {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeSpawner {
        /// Queue the behaviour of the next process spawned for `lane`.
        pub fn script(&self, lane: LaneKind, lines: &[&str], exit: Option<i32>) {
            let state = FakeState {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                exit,
                terminations: 0,
            };
            self.inner
                .lock()
                .scripts
                .entry(lane)
                .or_default()
                .push_back(state);
        }

        /// Make the next `count` spawns for `lane` fail.
        pub fn fail_next(&self, lane: LaneKind, count: u32) {
            self.inner.lock().failures.insert(lane, count);
        }

        pub fn spawn_count(&self, lane: LaneKind) -> usize {
            self.inner
                .lock()
                .spawned
                .iter()
                .filter(|(kind, _, _)| *kind == lane)
                .count()
        }

        pub fn commands(&self, lane: LaneKind) -> Vec<TransferCommand> {
            self.inner
                .lock()
                .spawned
                .iter()
                .filter(|(kind, _, _)| *kind == lane)
                .map(|(_, cmd, _)| cmd.clone())
                .collect()
        }

        /// State of the `n`th process spawned for `lane`.
        pub fn process(&self, lane: LaneKind, n: usize) -> Arc<Mutex<FakeState>> {
            self.inner
                .lock()
                .spawned
                .iter()
                .filter(|(kind, _, _)| *kind == lane)
                .nth(n)
                .map(|(_, _, state)| state.clone())
                .expect("no such process")
        }

        pub fn latest(&self, lane: LaneKind) -> Arc<Mutex<FakeState>> {
            let count = self.spawn_count(lane);
            self.process(lane, count - 1)
        }

        pub fn emit(&self, lane: LaneKind, line: &str) {
            self.latest(lane).lock().lines.push_back(line.to_string());
        }

        pub fn exit(&self, lane: LaneKind, code: i32) {
            self.latest(lane).lock().exit = Some(code);
        }
    }

    impl Spawner for FakeSpawner {
        fn spawn(
            &mut self,
            command: &TransferCommand,
        ) -> Result<Box<dyn ProcessHandle>, BackupError> {
            let mut inner = self.inner.lock();
            if let Some(remaining) = inner.failures.get_mut(&command.lane) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackupError::Spawn {
                        program: command.program.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted"),
                    });
                }
            }
            let state = inner
                .scripts
                .get_mut(&command.lane)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_default();
            let state = Arc::new(Mutex::new(state));
            inner
                .spawned
                .push((command.lane, command.clone(), state.clone()));
            Ok(Box::new(FakeProcess { state }))
        }
    }
}
