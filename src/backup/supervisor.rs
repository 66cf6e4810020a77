//! Dual-lane throttle and crash supervisor.
//!
//! One cycle runs a large-file lane and a small-file lane side by side and
//! watches their combined output. Cloud providers throttle on aggregate
//! request rate, which shows up as a run of `0 B/s` readings with no
//! progress; when that lasts long enough the small-file lane (many small
//! requests) is paused so the large-file lane keeps its bandwidth. Fresh
//! progress from either lane brings it back. A lane whose process dies is
//! restarted straight away, without limit, until it exits cleanly.
//!
//! The loop is single-threaded and cooperative: each pass drains whatever
//! output is buffered, updates the shared [`ActivityWindow`], applies the
//! policy, then sleeps for the poll interval.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::classifier::{classify, LineClass};
use super::command::TransferCommand;
use super::error::BackupError;
use super::lane::Lane;
use super::process::Spawner;
use super::{LaneKind, LaneState};
use crate::utils::config::Config;

#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    /// Zero-speed readings needed before a stall can be declared.
    pub zero_speed_limit: u32,
    /// Time without any activity needed before a stall can be declared.
    pub stall_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            zero_speed_limit: 4,
            stall_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl ThrottlePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            zero_speed_limit: config.zero_speed_limit,
            stall_timeout: config.stall_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

/// Throughput signal shared by both lanes of a cycle.
///
/// `zero_speed_streak` only grows between activity lines and drops to zero
/// on any activity line from either lane.
#[derive(Debug, Clone)]
pub struct ActivityWindow {
    last_activity: Instant,
    zero_speed_streak: u32,
}

impl ActivityWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            zero_speed_streak: 0,
        }
    }

    pub fn observe(&mut self, class: LineClass, now: Instant) {
        match class {
            LineClass::Activity => {
                self.last_activity = now;
                self.zero_speed_streak = 0;
            }
            LineClass::ZeroSpeed => {
                self.zero_speed_streak = self.zero_speed_streak.saturating_add(1);
            }
            LineClass::Other => {}
        }
    }

    pub fn zero_speed_streak(&self) -> u32 {
        self.zero_speed_streak
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_stalled(&self, policy: &ThrottlePolicy, now: Instant) -> bool {
        self.zero_speed_streak >= policy.zero_speed_limit && self.idle_for(now) > policy.stall_timeout
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Throttled {
        zero_speed_streak: u32,
        idle_for: Duration,
    },
    SmallLaneResumed,
    LaneRestarted {
        lane: LaneKind,
        exit_code: Option<i32>,
    },
    SpawnFailed {
        lane: LaneKind,
        reason: String,
    },
    LaneFinished {
        lane: LaneKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Running,
    Finished,
}

/// Summary of one finished cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub id: Uuid,
    pub elapsed: Duration,
    pub pauses: usize,
    pub restarts: usize,
    pub events: Vec<SupervisorEvent>,
}

pub struct Supervisor<'a> {
    id: Uuid,
    spawner: &'a mut dyn Spawner,
    policy: ThrottlePolicy,
    large: Lane,
    small: Lane,
    window: ActivityWindow,
    started: Instant,
    events: Vec<SupervisorEvent>,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        spawner: &'a mut dyn Spawner,
        policy: ThrottlePolicy,
        large: TransferCommand,
        small: TransferCommand,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            spawner,
            policy,
            large: Lane::new(large),
            small: Lane::new(small),
            window: ActivityWindow::new(now),
            started: now,
            events: Vec::new(),
        }
    }

    pub fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::Large => &self.large,
            LaneKind::Small => &self.small,
        }
    }

    pub fn window(&self) -> &ActivityWindow {
        &self.window
    }

    pub fn events(&self) -> &[SupervisorEvent] {
        &self.events
    }

    /// Run one cycle until both lanes have exited cleanly.
    pub async fn run(mut self) -> CycleReport {
        info!(cycle = %self.id, "Backup cycle started");
        self.start().await;

        loop {
            if self.step(Instant::now()) == CycleStatus::Finished {
                break;
            }
            sleep(self.policy.poll_interval).await;
        }

        self.report()
    }

    /// Spawn both lanes, giving the large lane one poll interval head start.
    pub async fn start(&mut self) {
        if let Err(e) = self.large.spawn(&mut *self.spawner) {
            note(&mut self.events, self.id, SupervisorEvent::SpawnFailed {
                lane: LaneKind::Large,
                reason: e.to_string(),
            });
        }
        sleep(self.policy.poll_interval).await;
        if let Err(e) = self.small.spawn(&mut *self.spawner) {
            note(&mut self.events, self.id, SupervisorEvent::SpawnFailed {
                lane: LaneKind::Small,
                reason: e.to_string(),
            });
        }
    }

    /// One drain-classify-decide pass.
    pub fn step(&mut self, now: Instant) -> CycleStatus {
        for lane in [&mut self.large, &mut self.small] {
            service_lane(
                lane,
                &mut self.window,
                &mut *self.spawner,
                &mut self.events,
                self.id,
                now,
            );
        }

        self.apply_throttle_policy(now);

        if self.large.state() == LaneState::Finished && self.small.state() == LaneState::Finished {
            CycleStatus::Finished
        } else {
            CycleStatus::Running
        }
    }

    fn apply_throttle_policy(&mut self, now: Instant) {
        let large_done = self.large.state() == LaneState::Finished;
        match self.small.state() {
            LaneState::Running if !large_done && self.window.is_stalled(&self.policy, now) => {
                let event = SupervisorEvent::Throttled {
                    zero_speed_streak: self.window.zero_speed_streak(),
                    idle_for: self.window.idle_for(now),
                };
                if self.small.pause() {
                    note(&mut self.events, self.id, event);
                }
            }
            LaneState::Paused => {
                // Nothing left to compete with once the large lane is done
                if self.window.zero_speed_streak() == 0 || large_done {
                    match self.small.resume(&mut *self.spawner) {
                        Ok(()) => note(&mut self.events, self.id, SupervisorEvent::SmallLaneResumed),
                        Err(e) => note(&mut self.events, self.id, SupervisorEvent::SpawnFailed {
                            lane: LaneKind::Small,
                            reason: e.to_string(),
                        }),
                    }
                }
            }
            _ => {}
        }
    }

    fn report(&self) -> CycleReport {
        let report = CycleReport {
            id: self.id,
            elapsed: self.started.elapsed(),
            pauses: self
                .events
                .iter()
                .filter(|e| matches!(e, SupervisorEvent::Throttled { .. }))
                .count(),
            restarts: self
                .events
                .iter()
                .filter(|e| matches!(e, SupervisorEvent::LaneRestarted { .. }))
                .count(),
            events: self.events.clone(),
        };
        info!(
            cycle = %report.id,
            "Backup cycle finished in {} ({} pauses, {} lane restarts)",
            humantime::format_duration(Duration::from_secs(report.elapsed.as_secs())),
            report.pauses,
            report.restarts
        );
        report
    }
}

fn service_lane(
    lane: &mut Lane,
    window: &mut ActivityWindow,
    spawner: &mut dyn Spawner,
    events: &mut Vec<SupervisorEvent>,
    cycle: Uuid,
    now: Instant,
) {
    match lane.state() {
        LaneState::Running => {}
        // an earlier spawn failed; keep trying every pass
        LaneState::Dead => {
            restart_lane(lane, spawner, events, cycle, None, now);
            return;
        }
        LaneState::Idle | LaneState::Paused | LaneState::Finished => return,
    }

    let poll = lane.poll();
    for line in &poll.lines {
        window.observe(classify(line), now);
    }

    match poll.exit {
        None => {}
        Some(Some(0)) => note(events, cycle, SupervisorEvent::LaneFinished { lane: lane.kind() }),
        Some(code) => {
            let err = BackupError::LaneExitNonZero {
                lane: lane.kind(),
                code,
            };
            warn!(cycle = %cycle, "{}", err);
            restart_lane(lane, spawner, events, cycle, code, now);
        }
    }
}

fn restart_lane(
    lane: &mut Lane,
    spawner: &mut dyn Spawner,
    events: &mut Vec<SupervisorEvent>,
    cycle: Uuid,
    exit_code: Option<i32>,
    now: Instant,
) {
    let event = match lane.restart(spawner, now) {
        Ok(()) => SupervisorEvent::LaneRestarted {
            lane: lane.kind(),
            exit_code,
        },
        Err(e) => SupervisorEvent::SpawnFailed {
            lane: lane.kind(),
            reason: e.to_string(),
        },
    };
    note(events, cycle, event);
}

/// Log an event and keep it for the cycle report.
fn note(events: &mut Vec<SupervisorEvent>, cycle: Uuid, event: SupervisorEvent) {
    match &event {
        SupervisorEvent::Throttled {
            zero_speed_streak,
            idle_for,
        } => warn!(
            cycle = %cycle,
            "Throttling detected: {} zero-speed readings, no activity for {}; pausing small-file lane",
            zero_speed_streak,
            humantime::format_duration(Duration::from_secs(idle_for.as_secs()))
        ),
        SupervisorEvent::SmallLaneResumed => {
            info!(cycle = %cycle, "Transfer activity resumed; restarting small-file lane")
        }
        SupervisorEvent::LaneRestarted { lane, exit_code } => match exit_code {
            Some(code) => warn!(cycle = %cycle, "Restarted {} lane after exit code {}", lane, code),
            None => warn!(cycle = %cycle, "Restarted {} lane", lane),
        },
        SupervisorEvent::SpawnFailed { lane, reason } => {
            error!(cycle = %cycle, "Could not start {} lane: {}", lane, reason)
        }
        SupervisorEvent::LaneFinished { lane } => {
            info!(cycle = %cycle, "{} lane finished", lane)
        }
    }
    events.push(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::command::{plan_lanes, TransferMode};
    use crate::backup::process::testing::FakeSpawner;
    use crate::utils::disk::FilesystemKind;
    use std::path::Path;

    const PROGRESS: &str = "2024/05/05 10:00:00 INFO  :   1 GiB / 3 GiB, 33%, 12 MiB/s, ETA 3m8s";
    const STALLED: &str = "2024/05/05 10:00:00 INFO  :   1 GiB / 3 GiB, 33%, 0 B/s, ETA -";

    fn policy() -> ThrottlePolicy {
        ThrottlePolicy {
            zero_speed_limit: 3,
            stall_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }

    fn commands() -> (TransferCommand, TransferCommand) {
        let config = Config {
            remote: "onedrive:".into(),
            ..Config::default()
        };
        plan_lanes(
            &config,
            Path::new("/media/BACKUP/cloud"),
            TransferMode::Copy,
            &FilesystemKind::ExFat,
        )
    }

    fn count(events: &[SupervisorEvent], pred: impl Fn(&SupervisorEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    /// Drive the small lane into a throttle pause.
    async fn throttle(sup: &mut Supervisor<'_>, spawner: &FakeSpawner) {
        for _ in 0..3 {
            spawner.emit(LaneKind::Small, STALLED);
        }
        sup.step(Instant::now());
        assert_eq!(sup.window().zero_speed_streak(), 3);
        // streak reached but not yet idle long enough
        assert_eq!(sup.lane(LaneKind::Small).state(), LaneState::Running);

        tokio::time::advance(Duration::from_secs(11)).await;
        spawner.emit(LaneKind::Small, STALLED);
        sup.step(Instant::now());
    }

    #[test]
    fn test_window_streak_resets_on_activity() {
        let t0 = Instant::now();
        let mut window = ActivityWindow::new(t0);

        let mut previous = 0;
        for class in [LineClass::ZeroSpeed, LineClass::Other, LineClass::ZeroSpeed] {
            window.observe(class, t0);
            assert!(window.zero_speed_streak() >= previous);
            previous = window.zero_speed_streak();
        }
        assert_eq!(window.zero_speed_streak(), 2);

        let t1 = t0 + Duration::from_secs(5);
        window.observe(LineClass::Activity, t1);
        assert_eq!(window.zero_speed_streak(), 0);
        assert_eq!(window.last_activity(), t1);
    }

    #[test]
    fn test_stall_needs_both_streak_and_timeout() {
        let policy = policy();
        let t0 = Instant::now();
        let mut window = ActivityWindow::new(t0);
        let late = t0 + Duration::from_secs(11);

        assert!(!window.is_stalled(&policy, late));
        for _ in 0..3 {
            window.observe(LineClass::ZeroSpeed, t0);
        }
        assert!(!window.is_stalled(&policy, t0 + Duration::from_secs(5)));
        assert!(window.is_stalled(&policy, late));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_pauses_small_lane_once() {
        let spawner = FakeSpawner::default();
        let mut handle = spawner.clone();
        let (large, small) = commands();
        let mut sup = Supervisor::new(&mut handle, policy(), large, small);
        sup.start().await;

        throttle(&mut sup, &spawner).await;
        assert_eq!(sup.lane(LaneKind::Small).state(), LaneState::Paused);
        assert_eq!(spawner.latest(LaneKind::Small).lock().terminations, 1);

        // still stalled: no second pause, no termination
        spawner.emit(LaneKind::Large, STALLED);
        sup.step(Instant::now());
        sup.step(Instant::now());

        assert_eq!(
            count(sup.events(), |e| matches!(e, SupervisorEvent::Throttled { .. })),
            1
        );
        assert_eq!(spawner.latest(LaneKind::Small).lock().terminations, 1);
        assert_eq!(sup.lane(LaneKind::Large).state(), LaneState::Running);
        assert_eq!(spawner.spawn_count(LaneKind::Large), 1);
        assert_eq!(spawner.latest(LaneKind::Large).lock().terminations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resumes_small_lane() {
        let spawner = FakeSpawner::default();
        let mut handle = spawner.clone();
        let (large, small) = commands();
        let mut sup = Supervisor::new(&mut handle, policy(), large, small);
        sup.start().await;
        throttle(&mut sup, &spawner).await;
        assert_eq!(spawner.spawn_count(LaneKind::Small), 1);

        spawner.emit(LaneKind::Large, PROGRESS);
        sup.step(Instant::now());

        assert_eq!(sup.window().zero_speed_streak(), 0);
        assert_eq!(sup.lane(LaneKind::Small).state(), LaneState::Running);
        assert_eq!(spawner.spawn_count(LaneKind::Small), 2);
        assert!(sup.events().contains(&SupervisorEvent::SmallLaneResumed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_lane_resumes_when_large_lane_finishes() {
        let spawner = FakeSpawner::default();
        let mut handle = spawner.clone();
        let (large, small) = commands();
        let mut sup = Supervisor::new(&mut handle, policy(), large, small);
        sup.start().await;
        throttle(&mut sup, &spawner).await;

        spawner.exit(LaneKind::Large, 0);
        sup.step(Instant::now());

        assert_eq!(sup.lane(LaneKind::Large).state(), LaneState::Finished);
        assert_eq!(sup.lane(LaneKind::Small).state(), LaneState::Running);
        assert_ne!(sup.window().zero_speed_streak(), 0);

        // still stalled, but with the large lane gone there is nothing to protect
        sup.step(Instant::now());
        assert_eq!(sup.lane(LaneKind::Small).state(), LaneState::Running);
        assert_eq!(spawner.spawn_count(LaneKind::Small), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_lane_restarts_within_one_pass() {
        let spawner = FakeSpawner::default();
        let mut handle = spawner.clone();
        let (large, small) = commands();
        let mut sup = Supervisor::new(&mut handle, policy(), large, small);
        sup.start().await;
        spawner.emit(LaneKind::Small, PROGRESS);

        spawner.exit(LaneKind::Large, 1);
        assert_eq!(sup.step(Instant::now()), CycleStatus::Running);

        assert_eq!(spawner.spawn_count(LaneKind::Large), 2);
        let commands = spawner.commands(LaneKind::Large);
        assert_eq!(commands[0], commands[1]);
        assert_eq!(sup.lane(LaneKind::Large).state(), LaneState::Running);
        assert!(sup.events().contains(&SupervisorEvent::LaneRestarted {
            lane: LaneKind::Large,
            exit_code: Some(1),
        }));
        // a restart leaves the shared window alone
        assert_eq!(sup.window().zero_speed_streak(), 0);
        assert_eq!(spawner.spawn_count(LaneKind::Small), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_spawn_is_retried_every_pass() {
        let spawner = FakeSpawner::default();
        spawner.fail_next(LaneKind::Large, 2);
        let mut handle = spawner.clone();
        let (large, small) = commands();
        let mut sup = Supervisor::new(&mut handle, policy(), large, small);
        sup.start().await;
        assert!(sup.lane(LaneKind::Large).is_dead());

        sup.step(Instant::now());
        assert!(sup.lane(LaneKind::Large).is_dead());
        sup.step(Instant::now());
        assert_eq!(sup.lane(LaneKind::Large).state(), LaneState::Running);
        assert_eq!(spawner.spawn_count(LaneKind::Large), 1);
        assert_eq!(
            count(sup.events(), |e| matches!(e, SupervisorEvent::SpawnFailed { .. })),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_ends_when_both_lanes_exit_cleanly() {
        let spawner = FakeSpawner::default();
        spawner.script(LaneKind::Large, &[PROGRESS], Some(0));
        spawner.script(LaneKind::Small, &[PROGRESS, "photo.jpg: Copied (new)"], Some(0));
        let mut handle = spawner.clone();
        let (large, small) = commands();
        let sup = Supervisor::new(&mut handle, policy(), large, small);

        let report = tokio::time::timeout(Duration::from_secs(5), sup.run())
            .await
            .expect("cycle should finish");

        assert_eq!(report.restarts, 0);
        assert_eq!(report.pauses, 0);
        assert_eq!(
            count(&report.events, |e| matches!(e, SupervisorEvent::LaneFinished { .. })),
            2
        );
        assert_eq!(spawner.spawn_count(LaneKind::Large), 1);
        assert_eq!(spawner.spawn_count(LaneKind::Small), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_lane_gets_head_start() {
        let spawner = FakeSpawner::default();
        let mut handle = spawner.clone();
        let (large, small) = commands();
        let mut sup = Supervisor::new(&mut handle, policy(), large, small);

        let before = Instant::now();
        sup.start().await;
        let waited = Instant::now() - before;
        assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(200));
        assert_eq!(spawner.spawn_count(LaneKind::Large), 1);
        assert_eq!(spawner.spawn_count(LaneKind::Small), 1);
    }
}
