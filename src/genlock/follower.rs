//! Follower receive loop

use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{LocalClock, Shared};
use super::SyncState;
use crate::types::{PacketRejection, SYNC_PACKET_SIZE, SyncPacket};

/// Pause after a receive error so a broken socket cannot spin the task.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub(super) fn spawn(
    socket: UdpSocket,
    clock: LocalClock,
    shared: Arc<Shared>,
) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        run(socket, clock, shared, task_cancel).await;
    });
    (cancel, handle)
}

/// Receive, validate and fold packets into the shared estimate until cancelled.
async fn run(socket: UdpSocket, clock: LocalClock, shared: Arc<Shared>, cancel: CancellationToken) {
    info!(local = ?socket.local_addr().ok(), "Genlock follower task started");
    // Oversized so that longer datagrams are seen as such instead of truncated
    let mut buf = [0u8; SYNC_PACKET_SIZE * 2];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => result,
        };
        let local_ns = clock.now_ns();

        match received {
            Ok((len, source)) => {
                let outcome = apply_datagram(&mut shared.write(), local_ns, &buf[..len]);
                match outcome {
                    Datagram::Applied { frame_number, offset_ns } => {
                        trace!(%source, frame = frame_number, offset_ns, "Genlock packet")
                    }
                    Datagram::RateMismatch(fps) => {
                        trace!(%source, fps, "Ignoring packet at a different rate")
                    }
                    Datagram::Rejected(rejection) => {
                        trace!(%source, ?rejection, "Discarding invalid genlock packet")
                    }
                }
            }
            Err(e) => {
                shared.write().transport_errors += 1;
                debug!("Failed to receive genlock packet: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    debug!("Genlock follower task exited");
}

/// What one received datagram did to the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Datagram {
    Applied { frame_number: i64, offset_ns: i64 },
    RateMismatch(u32),
    Rejected(PacketRejection),
}

/// Validate a datagram received at `local_ns` and fold it into `state`.
fn apply_datagram(state: &mut SyncState, local_ns: i64, data: &[u8]) -> Datagram {
    let packet = match SyncPacket::decode(data) {
        Ok(packet) => packet,
        Err(rejection) => {
            state.integrity_failures += 1;
            return Datagram::Rejected(rejection);
        }
    };
    if packet.fps != state.fps {
        state.rate_mismatches += 1;
        return Datagram::RateMismatch(packet.fps);
    }
    let offset_ns = state.observe(local_ns, &packet);
    Datagram::Applied { frame_number: packet.frame_number, offset_ns }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenlockMode;

    fn follower() -> SyncState {
        let mut state = SyncState::new(GenlockMode::Follower, 60, 200_000_000);
        state.active = true;
        state
    }

    #[test]
    fn flipped_checksum_between_valid_packets_leaves_the_estimate_alone() {
        let a = SyncPacket::new(1_000_000_000, 1, 60).encode();
        let mut a_prime = SyncPacket::new(1_016_000_000, 2, 60).encode();
        a_prime[28] ^= 0x01;
        let b = SyncPacket::new(1_033_000_000, 3, 60).encode();

        let mut state = follower();
        assert!(matches!(apply_datagram(&mut state, 1_005_000_000, &a), Datagram::Applied { .. }));
        assert!(matches!(
            apply_datagram(&mut state, 1_500_000_000, &a_prime),
            Datagram::Rejected(PacketRejection::Checksum { .. })
        ));
        assert!(matches!(apply_datagram(&mut state, 1_040_000_000, &b), Datagram::Applied { .. }));

        // Same two valid samples without the corrupt one in between
        let mut clean = follower();
        apply_datagram(&mut clean, 1_005_000_000, &a);
        apply_datagram(&mut clean, 1_040_000_000, &b);

        assert_eq!(state.smoothed_offset_ns(), clean.smoothed_offset_ns());
        // 5 ms seeded, then a 7 ms sample moves it a tenth of the way
        assert_eq!(state.smoothed_offset_ns(), 5_200_000);
        assert_eq!(state.integrity_failures, 1);
        assert_eq!(state.packets_received, 2);
    }

    #[test]
    fn other_rates_are_counted_not_applied() {
        let mut state = follower();
        let packet = SyncPacket::new(0, 1, 30).encode();
        assert_eq!(apply_datagram(&mut state, 10, &packet), Datagram::RateMismatch(30));
        assert_eq!(state.rate_mismatches, 1);
        assert_eq!(state.packets_received, 0);
        assert!(!state.is_synchronized_at(10));
    }
}
