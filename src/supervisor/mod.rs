//! Worker supervision.
//!
//! One [`WorkerSupervisor`] manages one stream's worker process. All of its
//! state lives in a single coordinator task that reacts to three kinds of
//! event:
//!
//! - commands from the handle (`start`, `stop`)
//! - process exits, reported by a monitor task per launched process
//! - timers: the pending restart delay and the periodic health sample
//!
//! A `stop()` marks the worker as stopping before the process is signalled, so
//! the resulting exit is classified as intentional: counters reset and nothing
//! is restarted. Any other exit is a crash and goes through the backoff policy
//! in [`RestartPolicy`]. Health sampling only marks a worker unhealthy; it
//! never restarts it. Samples run in their own task and come back as events,
//! so a slow status endpoint never holds up a command or an exit.

mod exit;
mod health;
mod launcher;
mod manager;
mod policy;
mod record;

pub use exit::{DIAGNOSTIC_TAIL, ExitCategory, ExitReport};
pub use health::{FnProbe, HealthProbe};
pub use launcher::{Launcher, ProcessLauncher, WorkerProcess};
pub use manager::StreamManager;
pub use policy::{HealthPolicy, RestartPolicy};
pub use record::{HealthChange, LaunchSpec, WorkerPhase, WorkerRecord, WorkerStatus};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::SupervisorConfig;
use crate::{FrameLockError, Result};

/// Extra time allowed after the stop grace period before giving up on an exit.
const EXIT_WAIT_SLACK: Duration = Duration::from_secs(2);

enum Command {
    Start { launch: LaunchSpec, reply: oneshot::Sender<Result<()>> },
    Stop { reply: oneshot::Sender<Result<()>> },
}

struct ExitEvent {
    generation: u64,
    report: Result<ExitReport>,
}

struct HealthSample {
    generation: u64,
    fps: Result<f32>,
}

/// Supervises one worker process.
pub struct WorkerSupervisor {
    stream: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<WorkerStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    /// Spawn the coordinator task on the current Tokio runtime.
    pub fn spawn(
        stream: impl Into<String>,
        launcher: Arc<dyn Launcher>,
        probe: Option<Arc<dyn HealthProbe>>,
        config: SupervisorConfig,
    ) -> Self {
        let stream = stream.into();
        let record = WorkerRecord::new(stream.clone());
        let (status_tx, status_rx) = watch::channel(record.status());
        let (command_tx, command_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let coordinator = Coordinator {
            record,
            launcher,
            probe,
            config,
            status_tx,
            exit_tx,
            sample_tx,
            sampling: false,
            generation: 0,
            current: None,
            restart_at: None,
            stop_waiters: Vec::new(),
        };
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            coordinator.run(command_rx, exit_rx, sample_rx, task_cancel).await;
        });

        Self {
            stream,
            commands: command_tx,
            status: status_rx,
            cancel,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Launch the worker. A manual start resets the restart budget.
    ///
    /// Idempotent while the worker is running.
    pub async fn start(&self, binary: impl Into<PathBuf>, args: Vec<String>) -> Result<()> {
        let launch = LaunchSpec { binary: binary.into(), args };
        self.request(|reply| Command::Start { launch, reply }).await
    }

    /// Stop the worker and wait for it to exit. Cancels a pending restart.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Status updates, starting with the current value.
    pub fn subscribe(&self) -> WatchStream<WorkerStatus> {
        WatchStream::new(self.status.clone())
    }

    pub fn watch(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    /// Stop the worker and end the coordinator. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            warn!(stream = %self.stream, "Supervisor task ended abnormally: {}", e);
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| FrameLockError::closed(format!("supervisor '{}'", self.stream)))?;
        reply_rx.await.map_err(|_| FrameLockError::closed(format!("supervisor '{}'", self.stream)))?
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("stream", &self.stream)
            .field("phase", &self.status.borrow().phase)
            .finish()
    }
}

struct RunningWorker {
    generation: u64,
    stop: Option<oneshot::Sender<Duration>>,
}

/// Owns the [`WorkerRecord`]; the only place it is mutated.
struct Coordinator {
    record: WorkerRecord,
    launcher: Arc<dyn Launcher>,
    probe: Option<Arc<dyn HealthProbe>>,
    config: SupervisorConfig,
    status_tx: watch::Sender<WorkerStatus>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    sample_tx: mpsc::UnboundedSender<HealthSample>,
    /// A health sample is in flight
    sampling: bool,
    generation: u64,
    current: Option<RunningWorker>,
    restart_at: Option<Instant>,
    stop_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut exits: mpsc::UnboundedReceiver<ExitEvent>,
        mut samples: mpsc::UnboundedReceiver<HealthSample>,
        cancel: CancellationToken,
    ) {
        let stream = self.record.stream().to_string();
        debug!(%stream, "Supervisor started");

        let interval = self.config.health.interval();
        let mut health = tokio::time::interval_at(Instant::now() + interval, interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sample_health = self.probe.is_some() && self.config.health.enabled;

        loop {
            let restart_at = self.restart_at;
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = exits.recv() => self.handle_exit(event),
                _ = sleep_until(restart_at) => self.restart().await,
                _ = health.tick(), if sample_health => self.sample_health(),
                Some(sample) = samples.recv() => self.apply_sample(sample),
            }
            self.publish();
        }

        self.finish(&mut exits).await;
        debug!(%stream, "Supervisor exited");
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.record.status());
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { launch, reply } => {
                if self.current.is_some() {
                    debug!(stream = %self.record.stream(), "Worker already running");
                    let _ = reply.send(Ok(()));
                    return;
                }

                self.restart_at = None;
                self.record.begin(launch);
                let result = self.launch().await;
                if let Err(e) = &result {
                    error!(stream = %self.record.stream(), "Failed to start worker: {}", e);
                    self.record.set_error(e.to_string());
                }
                self.publish();
                let _ = reply.send(result);
            }
            Command::Stop { reply } => match self.current.as_mut() {
                Some(current) => {
                    // Intent first, so the exit is classified as intentional
                    self.record.mark_stopping();
                    if let Some(stop) = current.stop.take() {
                        info!(stream = %self.record.stream(), "Stopping worker");
                        let _ = stop.send(self.config.stop_grace());
                    }
                    self.stop_waiters.push(reply);
                }
                None => {
                    if self.restart_at.take().is_some() {
                        info!(stream = %self.record.stream(), "Cancelled pending worker restart");
                    }
                    self.record.record_intentional_stop(None);
                    self.publish();
                    let _ = reply.send(Ok(()));
                }
            },
        }
    }

    async fn launch(&mut self) -> Result<()> {
        let launch = self.record.launch().cloned().ok_or_else(|| {
            FrameLockError::invalid_config("binary", "no launch arguments recorded")
        })?;
        let process = self.launcher.launch(&launch.binary, &launch.args).await?;

        self.generation += 1;
        let generation = self.generation;
        let pid = process.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(monitor(process, generation, stop_rx, self.exit_tx.clone()));

        self.current = Some(RunningWorker { generation, stop: Some(stop_tx) });
        self.record.mark_running(pid);
        info!(
            stream = %self.record.stream(),
            binary = %launch.binary.display(),
            pid = ?pid,
            "Worker started"
        );
        Ok(())
    }

    fn handle_exit(&mut self, event: ExitEvent) {
        if self.current.as_ref().map(|c| c.generation) != Some(event.generation) {
            trace!(generation = event.generation, "Ignoring exit of a replaced worker");
            return;
        }
        self.current = None;

        if self.record.phase() == WorkerPhase::Stopping {
            info!(stream = %self.record.stream(), "Worker stopped");
            self.record.record_intentional_stop(event.report.ok());
            self.publish();
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            return;
        }

        let (message, report) = match event.report {
            Ok(report) => (report.describe(), Some(report)),
            Err(e) => (e.to_string(), None),
        };
        warn!(stream = %self.record.stream(), error = %message, "Worker exited unexpectedly");
        self.record.record_crash(message, report);
        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        let policy = self.config.restart;
        match self.record.schedule_restart(&policy) {
            Some(delay) => {
                info!(
                    stream = %self.record.stream(),
                    attempt = self.record.restart_attempts(),
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling worker restart"
                );
                self.restart_at = Some(Instant::now() + delay);
            }
            None if policy.enabled => {
                let err = FrameLockError::RestartLimit {
                    stream: self.record.stream().to_string(),
                    attempts: self.record.restart_attempts(),
                    last_error: self.record.last_error().unwrap_or_default().to_string(),
                };
                error!("{}", err);
                self.record.set_error(err.to_string());
            }
            None => debug!(stream = %self.record.stream(), "Automatic restart disabled"),
        }
    }

    async fn restart(&mut self) {
        self.restart_at = None;
        if self.current.is_some() {
            return;
        }

        info!(
            stream = %self.record.stream(),
            attempt = self.record.restart_attempts(),
            "Restarting worker"
        );
        if let Err(e) = self.launch().await {
            warn!(stream = %self.record.stream(), "Worker restart failed: {}", e);
            self.record.record_crash(e.to_string(), None);
            self.schedule_restart();
        }
    }

    /// Spawn one sample of the running worker's frame rate.
    fn sample_health(&mut self) {
        let Some(probe) = self.probe.clone() else {
            return;
        };
        let Some(generation) = self.current.as_ref().map(|c| c.generation) else {
            return;
        };
        if self.sampling || self.record.phase() != WorkerPhase::Running {
            return;
        }

        self.sampling = true;
        let limit = self.config.health.probe_timeout();
        let samples = self.sample_tx.clone();
        tokio::spawn(async move {
            let fps = match tokio::time::timeout(limit, probe.sample()).await {
                Ok(result) => result,
                Err(_) => Err(FrameLockError::timeout(limit)),
            };
            let _ = samples.send(HealthSample { generation, fps });
        });
    }

    fn apply_sample(&mut self, sample: HealthSample) {
        self.sampling = false;
        if self.current.as_ref().map(|c| c.generation) != Some(sample.generation)
            || self.record.phase() != WorkerPhase::Running
        {
            trace!(generation = sample.generation, "Discarding health sample of a departed worker");
            return;
        }

        let policy = self.config.health;
        let fps = match sample.fps {
            Ok(fps) => fps,
            Err(e) => {
                debug!(stream = %self.record.stream(), "Health sample failed: {}", e);
                0.0
            }
        };

        match self.record.record_sample(fps, &policy) {
            HealthChange::BecameUnhealthy => {
                warn!(
                    stream = %self.record.stream(),
                    fps,
                    min_fps = policy.min_fps,
                    "Worker is running but not delivering frames"
                );
                self.record.set_error(format!(
                    "Worker stalled: frame rate below {} fps for {} consecutive samples",
                    policy.min_fps, policy.unhealthy_after
                ));
            }
            HealthChange::Recovered => {
                info!(stream = %self.record.stream(), fps, "Worker delivering frames again")
            }
            HealthChange::AttemptsReset => {
                debug!(stream = %self.record.stream(), "Sustained health, restart budget restored")
            }
            HealthChange::Unchanged => trace!(stream = %self.record.stream(), fps, "Health sample"),
        }
    }

    /// Stop a running worker on shutdown and settle outstanding requests.
    async fn finish(&mut self, exits: &mut mpsc::UnboundedReceiver<ExitEvent>) {
        self.restart_at = None;

        if let Some(mut current) = self.current.take() {
            self.record.mark_stopping();
            if let Some(stop) = current.stop.take() {
                let _ = stop.send(self.config.stop_grace());
            }

            let limit = self.config.stop_grace() + EXIT_WAIT_SLACK;
            let wait = wait_for_exit(exits, current.generation);
            match tokio::time::timeout(limit, wait).await {
                Ok(report) => self.record.record_intentional_stop(report),
                Err(_) => {
                    let err = FrameLockError::timeout(limit);
                    warn!(stream = %self.record.stream(), "Worker did not exit during shutdown: {}", err);
                    self.record.record_intentional_stop(None);
                    self.record.set_error(format!("Worker did not exit during shutdown: {}", err));
                }
            }
        }

        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.publish();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_exit(
    exits: &mut mpsc::UnboundedReceiver<ExitEvent>,
    generation: u64,
) -> Option<ExitReport> {
    while let Some(event) = exits.recv().await {
        if event.generation == generation {
            return event.report.ok();
        }
    }
    None
}

enum MonitorStep {
    Exited(Result<ExitReport>),
    Stop(Duration),
}

/// Owns one launched process and reports its exit.
async fn monitor(
    mut process: Box<dyn WorkerProcess>,
    generation: u64,
    mut stop: oneshot::Receiver<Duration>,
    exits: mpsc::UnboundedSender<ExitEvent>,
) {
    let step = tokio::select! {
        report = process.wait() => MonitorStep::Exited(report),
        Ok(grace) = &mut stop => MonitorStep::Stop(grace),
    };

    let report = match step {
        MonitorStep::Exited(report) => report,
        MonitorStep::Stop(grace) => {
            if let Err(e) = process.terminate(grace).await {
                warn!(pid = ?process.id(), "Failed to terminate worker: {}", e);
            }
            process.wait().await
        }
    };

    let _ = exits.send(ExitEvent { generation, report });
}
