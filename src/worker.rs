//! In-process wiring of the timing subsystem for one worker
//!
//! [`WorkerRuntime`] owns the worker's single [`GenlockClock`] and hands it to
//! the [`FramePump`]; nothing looks the clock up globally. The render loop
//! feeds frames through [`WorkerRuntime::submitter`] and calls
//! [`WorkerRuntime::heartbeat`] once per iteration.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::Result;
use crate::config::WorkerConfig;
use crate::genlock::GenlockClock;
use crate::pump::{FramePump, FrameSubmitter};
use crate::sink::FrameSink;
use crate::types::{GenlockMode, PeerAddress, RuntimeStatus};
use crate::watchdog::{Watchdog, WatchdogAction};

/// Clock, pump and watchdog of one worker process.
pub struct WorkerRuntime {
    config: WorkerConfig,
    clock: Arc<GenlockClock>,
    pump: FramePump,
    watchdog: Option<Watchdog>,
    sink: Arc<dyn FrameSink>,
}

impl WorkerRuntime {
    /// Start with the default watchdog action (abort the process).
    pub async fn start(config: WorkerConfig, sink: Arc<dyn FrameSink>) -> Result<Self> {
        Self::start_with_watchdog_action(config, sink, WatchdogAction::Abort).await
    }

    pub async fn start_with_watchdog_action(
        config: WorkerConfig,
        sink: Arc<dyn FrameSink>,
        action: WatchdogAction,
    ) -> Result<Self> {
        config.validate()?;

        let clock = Arc::new(GenlockClock::from_config(&config.genlock, config.fps));
        clock.initialize().await?;

        let pump = FramePump::new(Arc::clone(&clock), Arc::clone(&sink), &config.pump_config());
        pump.start();

        let watchdog = if config.watchdog.enabled {
            let watchdog = Watchdog::from_config(&config.watchdog, action);
            if let Err(e) = watchdog.start() {
                pump.stop().await;
                clock.shutdown().await;
                return Err(e);
            }
            Some(watchdog)
        } else {
            None
        };

        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            genlock = %config.genlock.mode,
            "Worker timing started"
        );
        Ok(Self { config, clock, pump, watchdog, sink })
    }

    pub fn clock(&self) -> &Arc<GenlockClock> {
        &self.clock
    }

    pub fn pump(&self) -> &FramePump {
        &self.pump
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn submitter(&self) -> FrameSubmitter {
        self.pump.submitter()
    }

    pub fn submit_frame(&self, pixels: &[u8], width: u32, height: u32) -> bool {
        self.pump.submit_frame(pixels, width, height)
    }

    pub fn get_current_frame(&self, out: &mut Vec<u8>) -> Option<(u32, u32)> {
        self.pump.get_current_frame(out)
    }

    /// Called once per iteration of the control loop.
    pub fn heartbeat(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.heartbeat();
        }
    }

    pub fn time_since_heartbeat(&self) -> Option<Duration> {
        self.watchdog.as_ref().filter(|w| w.is_running()).map(Watchdog::time_since_heartbeat)
    }

    pub async fn set_genlock_mode(&self, mode: GenlockMode) -> Result<()> {
        self.clock.set_mode(mode).await.inspect_err(|e| {
            warn!(%mode, "Genlock mode change failed: {}", e);
        })
    }

    pub async fn set_genlock_peer(&self, peer: PeerAddress) -> Result<()> {
        self.clock.set_peer_address(peer).await.inspect_err(|e| {
            warn!(%peer, "Genlock peer change failed: {}", e);
        })
    }

    /// Read-only snapshot for the status surface.
    pub fn status(&self) -> RuntimeStatus {
        let frames = self.pump.stats();
        let tally = self.sink.tally();
        RuntimeStatus {
            genlock: self.clock.get_stats(),
            frames,
            drop_rate: frames.drop_rate(),
            current_fps: self.pump.current_fps(),
            target_fps: self.config.fps,
            width: self.config.width,
            height: self.config.height,
            connections: self.sink.connection_count(),
            on_program: tally.on_program,
            on_preview: tally.on_preview,
            heartbeat_age_ms: self.time_since_heartbeat().map(|d| d.as_millis() as u64),
        }
    }

    /// Stop watchdog, pump and clock in that order. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        self.pump.stop().await;
        self.clock.shutdown().await;
        info!("Worker timing stopped");
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("clock", &self.clock)
            .field("pump", &self.pump)
            .field("watchdog", &self.watchdog)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameLockError;
    use crate::test_utils::RecordingSink;
    use crate::types::{Tally, frame_len};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn small_config() -> WorkerConfig {
        WorkerConfig { width: 16, height: 16, fps: 30, ..Default::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn status_reflects_pump_and_sink() {
        let _ = tracing_subscriber::fmt::try_init();
        let sink = Arc::new(RecordingSink::new());
        sink.set_connections(3);
        sink.set_tally(Tally { on_program: true, on_preview: false });

        let runtime = WorkerRuntime::start_with_watchdog_action(
            small_config(),
            sink.clone(),
            WatchdogAction::Callback(Box::new(|| {})),
        )
        .await
        .unwrap();

        assert!(runtime.submit_frame(&vec![1u8; frame_len(16, 16)], 16, 16));
        runtime.heartbeat();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let status = runtime.status();
        assert_eq!(status.target_fps, 30);
        assert_eq!((status.width, status.height), (16, 16));
        assert_eq!(status.frames.sent, 1);
        assert!(status.frames.held > 0);
        assert_eq!(status.connections, 3);
        assert!(status.on_program);
        assert!(!status.on_preview);
        assert_eq!(status.genlock.mode, GenlockMode::Disabled);
        assert!(status.heartbeat_age_ms.is_some());

        let mut out = Vec::new();
        assert_eq!(runtime.get_current_frame(&mut out), Some((16, 16)));

        runtime.shutdown().await;
        runtime.shutdown().await;
        assert!(runtime.time_since_heartbeat().is_none());
        assert!(!runtime.pump().is_running());
    }

    #[tokio::test]
    async fn genlock_can_be_reconfigured_at_runtime() {
        let mut config = small_config();
        config.watchdog.enabled = false;
        config.genlock.peer =
            PeerAddress::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 45_966));
        let runtime = WorkerRuntime::start(config, Arc::new(RecordingSink::new())).await.unwrap();

        runtime.set_genlock_mode(GenlockMode::Reference).await.unwrap();
        assert_eq!(runtime.status().genlock.mode, GenlockMode::Reference);
        assert!(runtime.status().genlock.synchronized);
        assert!(runtime.status().heartbeat_age_ms.is_none());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_anything_starts() {
        let config = WorkerConfig { fps: 0, ..Default::default() };
        let err = WorkerRuntime::start(config, Arc::new(RecordingSink::new())).await.unwrap_err();
        assert!(matches!(err, FrameLockError::InvalidConfig { .. }));
    }
}
