//! Restart and health-check policies

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for restarting a worker that exited unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self { enabled: true, base_delay_ms: 2_000, max_attempts: 5 }
    }
}

impl RestartPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay before restart number `attempts + 1`, or `None` once attempts are
    /// exhausted or restarts are disabled.
    ///
    /// With the defaults this yields 2s, 4s, 8s, 16s, 32s and then `None`.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if !self.enabled || attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        Some(self.base_delay().saturating_mul(factor))
    }
}

/// Periodic frame-rate sampling of a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Samples below this rate count as stalled
    pub min_fps: f32,
    pub unhealthy_after: u32,
    /// Consecutive healthy samples after which `restart_attempts` is cleared
    pub healthy_reset_after: u32,
    pub window: usize,
    pub probe_timeout_ms: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            min_fps: 0.5,
            unhealthy_after: 3,
            healthy_reset_after: 6,
            window: 10,
            probe_timeout_ms: 2_000,
        }
    }
}

impl HealthPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn is_stalled(&self, fps: f32) -> bool {
        fps.is_nan() || fps < self.min_fps
    }
}
