//! YAML configuration
//!
//! Durations are given in milliseconds. Every field has a default, so an empty
//! document is a valid configuration:
//!
//! ```yaml
//! width: 1920
//! height: 1080
//! fps: 60
//! color:
//!   color_space: Rec709
//!   range: Full
//! genlock:
//!   mode: follower
//!   peer: 239.1.1.1:5960
//!   sync_timeout_ms: 200
//! watchdog:
//!   timeout_ms: 30000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::supervisor::{HealthPolicy, RestartPolicy};
use crate::types::{ColorMetadata, GenlockMode, PeerAddress};
use crate::{FrameLockError, Result};

pub const MIN_DIMENSION: u32 = 16;
pub const MAX_WIDTH: u32 = 7680;
pub const MAX_HEIGHT: u32 = 4320;
pub const MAX_FPS: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenlockConfig {
    pub mode: GenlockMode,
    pub peer: PeerAddress,
    /// How long a follower stays synchronized without a valid packet
    pub sync_timeout_ms: u64,
}

impl Default for GenlockConfig {
    fn default() -> Self {
        Self {
            mode: GenlockMode::Disabled,
            peer: PeerAddress::default(),
            sync_timeout_ms: crate::genlock::DEFAULT_SYNC_TIMEOUT.as_millis() as u64,
        }
    }
}

impl GenlockConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_timeout_ms == 0 {
            return Err(FrameLockError::invalid_config("genlock.sync_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

/// Frame pump settings; resolution sizes the frame buffers up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub color: ColorMetadata,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self { width: 1920, height: 1080, fps: 60, color: ColorMetadata::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { enabled: true, timeout_ms: 30_000, poll_interval_ms: 1_000 }
    }
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Everything one worker process needs to run its timing subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub color: ColorMetadata,
    pub genlock: GenlockConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let pump = PumpConfig::default();
        Self {
            width: pump.width,
            height: pump.height,
            fps: pump.fps,
            color: pump.color,
            genlock: GenlockConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| FrameLockError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_DIMENSION..=MAX_WIDTH).contains(&self.width) {
            return Err(FrameLockError::invalid_config(
                "width",
                format!("must be between {} and {}", MIN_DIMENSION, MAX_WIDTH),
            ));
        }
        if !(MIN_DIMENSION..=MAX_HEIGHT).contains(&self.height) {
            return Err(FrameLockError::invalid_config(
                "height",
                format!("must be between {} and {}", MIN_DIMENSION, MAX_HEIGHT),
            ));
        }
        if !(1..=MAX_FPS).contains(&self.fps) {
            return Err(FrameLockError::invalid_config(
                "fps",
                format!("must be between 1 and {}", MAX_FPS),
            ));
        }
        if self.watchdog.enabled && self.watchdog.timeout_ms == 0 {
            return Err(FrameLockError::invalid_config("watchdog.timeout_ms", "must be positive"));
        }
        self.genlock.validate()
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig { width: self.width, height: self.height, fps: self.fps, color: self.color }
    }
}

/// Settings of the supervising process, shared by all streams.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart: RestartPolicy,
    pub health: HealthPolicy,
    /// Time a worker gets to exit after SIGTERM before it is killed
    pub stop_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            health: HealthPolicy::default(),
            stop_grace_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.restart.enabled && self.restart.base_delay_ms == 0 {
            return Err(FrameLockError::invalid_config("restart.base_delay_ms", "must be positive"));
        }
        if !self.health.min_fps.is_finite() || self.health.min_fps < 0.0 {
            return Err(FrameLockError::invalid_config("health.min_fps", "must be a non-negative number"));
        }
        if self.health.unhealthy_after == 0 {
            return Err(FrameLockError::invalid_config("health.unhealthy_after", "must be at least 1"));
        }
        if self.health.window == 0 {
            return Err(FrameLockError::invalid_config("health.window", "must be at least 1"));
        }
        Ok(())
    }
}
