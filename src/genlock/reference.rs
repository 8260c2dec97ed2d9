//! Reference send loop

use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{LocalClock, Shared, next_frame_boundary};
use crate::types::{PeerAddress, SyncPacket, frame_period_ns};

pub(super) fn spawn(
    socket: UdpSocket,
    peer: PeerAddress,
    fps: u32,
    clock: LocalClock,
    shared: Arc<Shared>,
) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        run(socket, peer, fps, clock, shared, task_cancel).await;
    });
    (cancel, handle)
}

/// Emit one packet per local frame boundary until cancelled.
async fn run(
    socket: UdpSocket,
    peer: PeerAddress,
    fps: u32,
    clock: LocalClock,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    info!(%peer, fps, "Genlock reference task started");
    let period = frame_period_ns(fps);
    let destination = peer.socket_addr();

    loop {
        let boundary = next_frame_boundary(clock.now_ns(), period);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(clock.instant_at(boundary)) => {}
        }

        let packet = SyncPacket::new(clock.now_ns(), boundary / period, fps);
        match socket.send_to(&packet.encode(), destination).await {
            Ok(_) => {
                shared.write().packets_sent += 1;
                trace!(frame = packet.frame_number, "Sent genlock packet");
            }
            Err(e) => {
                shared.write().transport_errors += 1;
                debug!("Failed to send genlock packet: {}", e);
            }
        }
    }

    debug!("Genlock reference task exited");
}
