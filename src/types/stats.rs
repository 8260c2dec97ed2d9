//! Read-only counters and snapshots exposed to monitoring layers

use serde::{Deserialize, Serialize};

use super::GenlockMode;

/// Snapshot of a clock sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub mode: GenlockMode,
    pub synchronized: bool,
    /// Follower-minus-reference offset currently applied, in microseconds
    pub offset_us: i64,
    /// Smoothed absolute deviation of per-packet offsets, in microseconds
    pub jitter_us: f64,
    /// Largest absolute per-packet offset observed, in microseconds
    pub max_offset_us: i64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Datagrams discarded for a bad length, magic, version or checksum
    pub integrity_failures: u64,
    /// Valid packets ignored because the reference runs at another rate
    pub rate_mismatches: u64,
    /// Socket send/receive errors
    pub transport_errors: u64,
    pub last_frame_number: Option<i64>,
    pub reference_fps: Option<u32>,
    /// Milliseconds since the last valid packet (followers only)
    pub last_packet_age_ms: Option<u64>,
}

/// Cadence counters of the frame pump.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameStats {
    pub sent: u64,
    pub dropped: u64,
    pub held: u64,
}

impl FrameStats {
    /// Number of cadence boundaries accounted for.
    pub fn ticks(&self) -> u64 {
        self.sent + self.dropped + self.held
    }

    /// Fraction of boundaries on which an undelivered frame was discarded.
    pub fn drop_rate(&self) -> f64 {
        match self.ticks() {
            0 => 0.0,
            ticks => self.dropped as f64 / ticks as f64,
        }
    }
}

/// Combined worker status for an external status surface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub genlock: SyncStats,
    pub frames: FrameStats,
    pub drop_rate: f64,
    pub current_fps: f32,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub connections: usize,
    pub on_program: bool,
    pub on_preview: bool,
    /// Milliseconds since the control loop last reported in
    pub heartbeat_age_ms: Option<u64>,
}
