//! Reference and follower clocks talking over loopback UDP

use framelock::types::{ColorMetadata, GenlockMode, PeerAddress, SyncPacket, VideoFrame};
use framelock::{FramePump, FrameSink, GenlockClock, PumpConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Keeps (timestamp, timecode) of every delivered frame.
#[derive(Default)]
struct TimestampSink {
    frames: Mutex<Vec<(i64, i64)>>,
}

impl FrameSink for TimestampSink {
    fn send_video(&self, frame: &VideoFrame<'_>) -> framelock::Result<()> {
        self.frames.lock().unwrap().push((frame.timestamp_ns, frame.timecode));
        Ok(())
    }

    fn set_color_metadata(&self, _metadata: ColorMetadata) {}

    fn connection_count(&self) -> usize {
        1
    }
}

fn loopback(port: u16) -> PeerAddress {
    PeerAddress::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

/// Poll `condition` every 10 ms for up to `limit`.
async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_locks_to_reference() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let peer = loopback(45_970);

    let follower = GenlockClock::new(GenlockMode::Follower, peer, 60);
    follower.initialize().await?;
    let reference = GenlockClock::new(GenlockMode::Reference, peer, 60);
    reference.initialize().await?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    let stats = follower.get_stats();
    assert!(follower.is_synchronized(), "not synchronized: {:?}", stats);
    assert!(stats.packets_received >= 60, "{:?}", stats);
    assert_eq!(stats.integrity_failures, 0);
    assert_eq!(stats.reference_fps, Some(60));
    assert!(follower.offset_microseconds().abs() < 1_000, "{:?}", stats);
    assert!(reference.get_stats().packets_sent >= 60);

    // Both sides agree on which boundary comes next
    let period = follower.frame_period_ns();
    let follower_next = follower.next_frame_boundary(follower.now(), period);
    let reference_next = reference.next_frame_boundary(reference.now(), period);
    assert!((follower_next - reference_next).abs() <= period);

    reference.shutdown().await;
    follower.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_checksum_between_valid_packets_is_discarded() -> anyhow::Result<()> {
    let peer = loopback(45_971);
    let follower =
        GenlockClock::with_sync_timeout(GenlockMode::Follower, peer, 60, Duration::from_secs(5));
    follower.initialize().await?;
    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;

    // Unsynchronized, so now() is local time; A arrives 5 ms "late"
    let a = SyncPacket::new(follower.now() - 5_000_000, 1, 60);
    sender.send_to(&a.encode(), peer.socket_addr())?;
    assert!(eventually(Duration::from_secs(2), || follower.is_synchronized()).await);
    let after_a = follower.offset_microseconds();
    assert!((5_000..20_000).contains(&after_a), "offset {}", after_a);

    // Local time is now() plus the applied offset
    let local = follower.now() + after_a * 1_000;

    // A' claims a 500 ms offset but its checksum byte is flipped
    let mut a_prime = SyncPacket::new(local - 500_000_000, 2, 60).encode();
    a_prime[28] ^= 0x01;
    sender.send_to(&a_prime, peer.socket_addr())?;

    let b = SyncPacket::new(local - 5_000_000, 3, 60);
    sender.send_to(&b.encode(), peer.socket_addr())?;
    assert!(eventually(Duration::from_secs(2), || follower.get_stats().packets_received == 2).await);

    let stats = follower.get_stats();
    assert_eq!(stats.integrity_failures, 1);
    assert_eq!(stats.last_frame_number, Some(3));
    // Smoothing A and B keeps the estimate near 5 ms; accepting A' would
    // have pulled it past 50 ms
    let offset = follower.offset_microseconds();
    assert!((5_000..20_000).contains(&offset), "offset {} after A {}", offset, after_a);
    assert!(stats.max_offset_us < 50_000, "{:?}", stats);

    // A valid packet at another rate is ignored as well
    sender.send_to(&SyncPacket::new(follower.now(), 4, 30).encode(), peer.socket_addr())?;
    assert!(eventually(Duration::from_secs(2), || follower.get_stats().rate_mismatches == 1).await);
    assert_eq!(follower.offset_microseconds(), offset);

    follower.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silence_loses_synchronization() -> anyhow::Result<()> {
    let peer = loopback(45_972);
    let follower =
        GenlockClock::with_sync_timeout(GenlockMode::Follower, peer, 60, Duration::from_millis(100));
    follower.initialize().await?;

    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    sender.send_to(&SyncPacket::new(follower.now(), 1, 60).encode(), peer.socket_addr())?;
    assert!(eventually(Duration::from_secs(2), || follower.is_synchronized()).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!follower.is_synchronized());
    assert_eq!(follower.offset_microseconds(), 0);

    // Local time is used again, so now() tracks the host clock
    let before = follower.now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(follower.now() - before >= 20_000_000);

    follower.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pump_timestamps_follow_the_genlocked_clock() -> anyhow::Result<()> {
    let peer = loopback(45_973);
    let clock = Arc::new(GenlockClock::new(GenlockMode::Reference, peer, 30));
    clock.initialize().await?;

    let sink = Arc::new(TimestampSink::default());
    let config = PumpConfig { width: 16, height: 16, fps: 30, ..Default::default() };
    let pump = FramePump::new(Arc::clone(&clock), sink.clone(), &config);
    assert!(!pump.submit_frame(&vec![7u8; framelock::frame_len(16, 16)], 16, 16));
    pump.start();
    assert!(pump.submit_frame(&vec![7u8; framelock::frame_len(16, 16)], 16, 16));

    tokio::time::sleep(Duration::from_millis(500)).await;
    pump.stop().await;

    let period = clock.frame_period_ns();
    let frames = sink.frames.lock().unwrap().clone();
    assert!(frames.len() >= 10, "only {} deliveries", frames.len());
    for (timestamp, timecode) in &frames {
        assert_eq!(timestamp % period, 0);
        assert_eq!(*timecode, timestamp / 100);
    }
    for pair in frames.windows(2) {
        assert!(pair[1].0 > pair[0].0);
    }

    clock.shutdown().await;
    Ok(())
}
