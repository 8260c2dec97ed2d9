//! Core types shared by the genlock engine, frame pump and supervisor.
//!
//! ## Contents
//!
//! - [`SyncPacket`] is the fixed 32-byte genlock datagram and its codec
//! - [`GenlockMode`] and [`PeerAddress`] describe a clock's role and peer
//! - [`VideoFrame`], [`ColorMetadata`] and [`Tally`] form the sink contract
//! - [`SyncStats`], [`FrameStats`] and [`RuntimeStatus`] are read-only snapshots
//!
//! ## Usage Example
//!
//! ```rust
//! use framelock::types::{SyncPacket, SYNC_PACKET_SIZE};
//!
//! let packet = SyncPacket::new(16_666_667, 1, 60);
//! let bytes = packet.encode();
//! assert_eq!(bytes.len(), SYNC_PACKET_SIZE);
//! assert_eq!(SyncPacket::decode(&bytes), Ok(packet));
//! ```

mod address;
mod frame;
mod mode;
mod packet;
mod stats;

pub use address::PeerAddress;
pub use frame::{
    BYTES_PER_PIXEL, ColorMetadata, ColorRange, ColorSpace, GammaMode, TIMECODE_SYNTHESIZE, Tally,
    VideoFrame, frame_len,
};
pub use mode::GenlockMode;
pub use packet::{
    DEFAULT_SYNC_PORT, PacketRejection, SYNC_MAGIC, SYNC_PACKET_SIZE, SYNC_VERSION, SyncPacket,
};
pub use stats::{FrameStats, RuntimeStatus, SyncStats};

/// Nominal duration of one frame at `fps`, in nanoseconds.
pub fn frame_period_ns(fps: u32) -> i64 {
    1_000_000_000 / i64::from(fps.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_period_for_common_rates() {
        assert_eq!(frame_period_ns(60), 16_666_666);
        assert_eq!(frame_period_ns(25), 40_000_000);
        assert_eq!(frame_period_ns(0), 1_000_000_000);
    }
}
