//! Per-stream worker bookkeeping

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use super::exit::ExitReport;
use super::policy::{HealthPolicy, RestartPolicy};

/// Binary and arguments a worker was (or will be) started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    #[default]
    Stopped,
    Running,
    /// Stop requested; waiting for the process to exit
    Stopping,
    /// Waiting out a restart delay
    BackingOff,
    /// Restart attempts exhausted
    Failed,
}

/// Snapshot of a [`WorkerRecord`] for monitoring.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub stream: String,
    pub phase: WorkerPhase,
    pub is_running: bool,
    pub is_healthy: bool,
    pub pid: Option<u32>,
    pub launch: Option<LaunchSpec>,
    pub crash_count: u32,
    pub restart_attempts: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<SystemTime>,
    pub last_exit: Option<ExitReport>,
    pub recent_fps: Vec<f32>,
    pub restart_delay_ms: Option<u64>,
}

/// Health transition caused by one frame-rate sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Unchanged,
    BecameUnhealthy,
    Recovered,
    /// Sustained healthy operation cleared the restart counter
    AttemptsReset,
}

/// Lifecycle state of one supervised stream.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    stream: String,
    launch: Option<LaunchSpec>,
    pid: Option<u32>,
    phase: WorkerPhase,
    is_healthy: bool,
    crash_count: u32,
    restart_attempts: u32,
    last_error: Option<(String, SystemTime)>,
    last_exit: Option<ExitReport>,
    samples: VecDeque<f32>,
    low_streak: u32,
    healthy_streak: u32,
    restart_delay: Option<Duration>,
}

impl WorkerRecord {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            launch: None,
            pid: None,
            phase: WorkerPhase::Stopped,
            is_healthy: true,
            crash_count: 0,
            restart_attempts: 0,
            last_error: None,
            last_exit: None,
            samples: VecDeque::new(),
            low_streak: 0,
            healthy_streak: 0,
            restart_delay: None,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn launch(&self) -> Option<&LaunchSpec> {
        self.launch.as_ref()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, WorkerPhase::Running | WorkerPhase::Stopping)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_ref().map(|(message, _)| message.as_str())
    }

    /// A manual start: new launch arguments and a fresh restart budget.
    pub(crate) fn begin(&mut self, launch: LaunchSpec) {
        self.launch = Some(launch);
        self.restart_attempts = 0;
        self.restart_delay = None;
    }

    pub(crate) fn mark_running(&mut self, pid: Option<u32>) {
        self.phase = WorkerPhase::Running;
        self.pid = pid;
        self.is_healthy = true;
        self.samples.clear();
        self.low_streak = 0;
        self.healthy_streak = 0;
        self.restart_delay = None;
    }

    pub(crate) fn mark_stopping(&mut self) {
        if self.phase == WorkerPhase::Running {
            self.phase = WorkerPhase::Stopping;
        }
    }

    /// The process ended after a stop request, or a pending restart was cancelled.
    pub(crate) fn record_intentional_stop(&mut self, report: Option<ExitReport>) {
        self.phase = WorkerPhase::Stopped;
        self.pid = None;
        self.crash_count = 0;
        self.restart_attempts = 0;
        self.restart_delay = None;
        self.last_error = None;
        self.is_healthy = true;
        if report.is_some() {
            self.last_exit = report;
        }
    }

    /// The process ended, or failed to launch, without a stop request.
    pub(crate) fn record_crash(&mut self, message: String, report: Option<ExitReport>) {
        self.phase = WorkerPhase::Stopped;
        self.pid = None;
        self.crash_count += 1;
        self.set_error(message);
        if report.is_some() {
            self.last_exit = report;
        }
    }

    /// Consume one restart attempt; `None` when the policy gives up.
    pub(crate) fn schedule_restart(&mut self, policy: &RestartPolicy) -> Option<Duration> {
        match policy.next_delay(self.restart_attempts) {
            Some(delay) => {
                self.restart_attempts += 1;
                self.phase = WorkerPhase::BackingOff;
                self.restart_delay = Some(delay);
                Some(delay)
            }
            None => {
                self.phase = if policy.enabled { WorkerPhase::Failed } else { WorkerPhase::Stopped };
                self.restart_delay = None;
                None
            }
        }
    }

    pub(crate) fn set_error(&mut self, message: String) {
        self.last_error = Some((message, SystemTime::now()));
    }

    /// Fold one frame-rate sample into the health window.
    pub(crate) fn record_sample(&mut self, fps: f32, policy: &HealthPolicy) -> HealthChange {
        if self.samples.len() >= policy.window.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(fps);

        if policy.is_stalled(fps) {
            self.healthy_streak = 0;
            self.low_streak += 1;
            if self.is_healthy && self.low_streak >= policy.unhealthy_after {
                self.is_healthy = false;
                return HealthChange::BecameUnhealthy;
            }
            return HealthChange::Unchanged;
        }

        self.low_streak = 0;
        self.healthy_streak += 1;
        if !self.is_healthy {
            self.is_healthy = true;
            return HealthChange::Recovered;
        }
        if self.restart_attempts > 0 && self.healthy_streak >= policy.healthy_reset_after {
            self.restart_attempts = 0;
            return HealthChange::AttemptsReset;
        }
        HealthChange::Unchanged
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            stream: self.stream.clone(),
            phase: self.phase,
            is_running: self.is_running(),
            is_healthy: self.is_healthy,
            pid: self.pid,
            launch: self.launch.clone(),
            crash_count: self.crash_count,
            restart_attempts: self.restart_attempts,
            last_error: self.last_error.as_ref().map(|(message, _)| message.clone()),
            last_error_at: self.last_error.as_ref().map(|(_, at)| *at),
            last_exit: self.last_exit.clone(),
            recent_fps: self.samples.iter().copied().collect(),
            restart_delay_ms: self.restart_delay.map(|d| d.as_millis() as u64),
        }
    }
}
