//! Test doubles for the frame sink and the worker launcher
//!
//! Shared by unit tests and benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::sink::FrameSink;
use crate::supervisor::{ExitReport, LaunchSpec, Launcher, WorkerProcess};
use crate::types::{ColorMetadata, Tally, VideoFrame};
use crate::{FrameLockError, Result};

/// What the sink saw for one delivered frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub timestamp_ns: i64,
    pub timecode: i64,
    pub repeated: bool,
    pub first_byte: Option<u8>,
}

/// Sink that records every delivery.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<DeliveredFrame>>,
    color: Mutex<Option<ColorMetadata>>,
    tally: Mutex<Tally>,
    connections: AtomicUsize,
    fail: AtomicBool,
    send_delay: Mutex<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn records(&self) -> Vec<DeliveredFrame> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn color(&self) -> Option<ColorMetadata> {
        *self.color.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_connections(&self, count: usize) {
        self.connections.store(count, Ordering::SeqCst);
    }

    pub fn set_tally(&self, tally: Tally) {
        *self.tally.lock().unwrap_or_else(PoisonError::into_inner) = tally;
    }

    /// Block every `send_video` call for `delay` of wall-clock time.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make `send_video` fail without recording.
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl FrameSink for RecordingSink {
    fn send_video(&self, frame: &VideoFrame<'_>) -> Result<()> {
        let delay = *self.send_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(FrameLockError::Transport { context: "sink offline".into(), source: None });
        }
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(DeliveredFrame {
            sequence: frame.sequence,
            width: frame.width,
            height: frame.height,
            timestamp_ns: frame.timestamp_ns,
            timecode: frame.timecode,
            repeated: frame.repeated,
            first_byte: frame.data.first().copied(),
        });
        Ok(())
    }

    fn set_color_metadata(&self, metadata: ColorMetadata) {
        *self.color.lock().unwrap_or_else(PoisonError::into_inner) = Some(metadata);
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn tally(&self) -> Tally {
        *self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How processes from a [`FakeLauncher`] behave.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Exit on their own after a delay
    Exit { after: Duration, report: ExitReport },
    /// Run until terminated or crashed via [`FakeLauncher::crash_current`]
    RunUntilStopped,
    /// Never exit, not even when terminated
    Hang,
}

/// Launcher producing scripted in-memory processes.
#[derive(Debug)]
pub struct FakeLauncher {
    behavior: Mutex<FakeBehavior>,
    launches: Mutex<Vec<(Instant, LaunchSpec)>>,
    fail: AtomicBool,
    next_pid: AtomicU32,
    crash: Arc<Notify>,
}

impl FakeLauncher {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            launches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
            crash: Arc::new(Notify::new()),
        }
    }

    /// Processes exit immediately with `report`.
    pub fn exiting_with(report: ExitReport) -> Self {
        Self::new(FakeBehavior::Exit { after: Duration::ZERO, report })
    }

    pub fn long_running() -> Self {
        Self::new(FakeBehavior::RunUntilStopped)
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make the running process exit with a segfault.
    pub fn crash_current(&self) {
        self.crash.notify_one();
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn launch_times(&self) -> Vec<Instant> {
        self.launches.lock().unwrap_or_else(PoisonError::into_inner).iter().map(|(at, _)| *at).collect()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, spec)| spec.clone())
            .collect()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, binary: &Path, args: &[String]) -> Result<Box<dyn WorkerProcess>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FrameLockError::launch_failed(
                binary,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            ));
        }

        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Instant::now(), LaunchSpec { binary: binary.to_path_buf(), args: args.to_vec() }));
        let behavior = self.behavior.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(Box::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            behavior,
            crash: Arc::clone(&self.crash),
            terminated: false,
            report: None,
        }))
    }
}

struct FakeProcess {
    pid: u32,
    behavior: FakeBehavior,
    crash: Arc<Notify>,
    terminated: bool,
    report: Option<ExitReport>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ExitReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }

        if matches!(self.behavior, FakeBehavior::Hang) {
            std::future::pending::<()>().await;
        }

        let report = if self.terminated {
            ExitReport::from_code(143)
        } else {
            match &self.behavior {
                FakeBehavior::Exit { after, report } => {
                    tokio::time::sleep(*after).await;
                    report.clone()
                }
                FakeBehavior::RunUntilStopped | FakeBehavior::Hang => {
                    self.crash.notified().await;
                    ExitReport::from_code(139)
                }
            }
        };
        self.report = Some(report.clone());
        Ok(report)
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<()> {
        self.terminated = true;
        Ok(())
    }
}
