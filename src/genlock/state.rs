//! Offset estimation state for a clock sync engine
//!
//! [`SyncState`] is updated by the network task and read by every consumer of
//! the clock. Offset and jitter live in one struct behind one lock so readers
//! never observe a half-applied update.

use crate::types::{GenlockMode, SyncPacket, SyncStats};

/// Exponential smoothing factor applied to per-packet offsets.
pub const OFFSET_SMOOTHING: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct SyncState {
    pub(crate) mode: GenlockMode,
    /// Network session is up (or mode is Disabled and initialized)
    pub(crate) active: bool,
    pub(crate) fps: u32,
    pub(crate) sync_timeout_ns: i64,

    smoothed_offset_ns: f64,
    jitter_ns: f64,
    max_offset_ns: i64,
    last_packet_local_ns: Option<i64>,
    last_frame_number: Option<i64>,
    reference_fps: Option<u32>,

    pub(crate) packets_sent: u64,
    pub(crate) packets_received: u64,
    pub(crate) integrity_failures: u64,
    pub(crate) rate_mismatches: u64,
    pub(crate) transport_errors: u64,
}

impl SyncState {
    pub fn new(mode: GenlockMode, fps: u32, sync_timeout_ns: i64) -> Self {
        Self {
            mode,
            active: false,
            fps,
            sync_timeout_ns,
            smoothed_offset_ns: 0.0,
            jitter_ns: 0.0,
            max_offset_ns: 0,
            last_packet_local_ns: None,
            last_frame_number: None,
            reference_fps: None,
            packets_sent: 0,
            packets_received: 0,
            integrity_failures: 0,
            rate_mismatches: 0,
            transport_errors: 0,
        }
    }

    /// Fold one valid packet received at `local_ns` into the estimate.
    ///
    /// The first packet after startup or after synchronization was lost seeds
    /// the estimate directly; later packets are smoothed. Returns the
    /// instantaneous offset of this packet.
    pub fn observe(&mut self, local_ns: i64, packet: &SyncPacket) -> i64 {
        let instant_offset = local_ns.saturating_sub(packet.timestamp_ns);

        if self.is_synchronized_at(local_ns) {
            self.smoothed_offset_ns +=
                OFFSET_SMOOTHING * (instant_offset as f64 - self.smoothed_offset_ns);
            let deviation = (instant_offset as f64 - self.smoothed_offset_ns).abs();
            self.jitter_ns += OFFSET_SMOOTHING * (deviation - self.jitter_ns);
        } else {
            self.smoothed_offset_ns = instant_offset as f64;
            self.jitter_ns = 0.0;
            self.max_offset_ns = 0;
        }

        self.max_offset_ns = self.max_offset_ns.max(instant_offset.saturating_abs());
        self.packets_received += 1;
        self.last_packet_local_ns = Some(local_ns);
        self.last_frame_number = Some(packet.frame_number);
        self.reference_fps = Some(packet.fps);

        instant_offset
    }

    /// Whether a valid packet arrived within the recency window ending at `local_ns`.
    pub fn is_synchronized_at(&self, local_ns: i64) -> bool {
        match self.mode {
            GenlockMode::Disabled => false,
            GenlockMode::Reference => self.active,
            GenlockMode::Follower => self
                .last_packet_local_ns
                .is_some_and(|last| local_ns.saturating_sub(last) <= self.sync_timeout_ns),
        }
    }

    pub fn smoothed_offset_ns(&self) -> i64 {
        self.smoothed_offset_ns.round() as i64
    }

    /// Offset subtracted from local time at `local_ns`; zero unless synchronized.
    pub fn applied_offset_ns(&self, local_ns: i64) -> i64 {
        match self.mode {
            GenlockMode::Follower if self.is_synchronized_at(local_ns) => self.smoothed_offset_ns(),
            _ => 0,
        }
    }

    pub fn jitter_ns(&self) -> f64 {
        self.jitter_ns
    }

    /// Forget the offset estimate, keeping lifetime counters.
    pub fn reset_estimate(&mut self) {
        self.smoothed_offset_ns = 0.0;
        self.jitter_ns = 0.0;
        self.max_offset_ns = 0;
        self.last_packet_local_ns = None;
        self.last_frame_number = None;
        self.reference_fps = None;
    }

    pub fn snapshot(&self, local_ns: i64) -> SyncStats {
        let synchronized = self.is_synchronized_at(local_ns);

        SyncStats {
            mode: self.mode,
            synchronized,
            offset_us: self.applied_offset_ns(local_ns) / 1_000,
            jitter_us: self.jitter_ns / 1_000.0,
            max_offset_us: self.max_offset_ns / 1_000,
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            integrity_failures: self.integrity_failures,
            rate_mismatches: self.rate_mismatches,
            transport_errors: self.transport_errors,
            last_frame_number: self.last_frame_number,
            reference_fps: self.reference_fps,
            last_packet_age_ms: self
                .last_packet_local_ns
                .map(|last| (local_ns.saturating_sub(last).max(0) / 1_000_000) as u64),
        }
    }
}
