//! Clock sync engine (genlock).
//!
//! A [`GenlockClock`] runs in one of three modes:
//!
//! - **Disabled**: the local monotonic clock, no network traffic
//! - **Reference**: broadcasts a [`SyncPacket`](crate::types::SyncPacket) on
//!   every local frame boundary
//! - **Follower**: receives those packets, estimates the follower-minus-reference
//!   offset and reports reference time from [`GenlockClock::now`]
//!
//! Frame-accurate alignment comes from [`GenlockClock::next_frame_boundary`]:
//! once a follower's clock reports reference time, rounding to multiples of the
//! frame period lands every process on identical nominal boundaries.
//!
//! The engine is owned explicitly. Whoever builds the worker creates one clock
//! and hands an `Arc<GenlockClock>` to each consumer.
//!
//! ```rust,no_run
//! use framelock::genlock::GenlockClock;
//! use framelock::types::GenlockMode;
//!
//! # #[tokio::main]
//! # async fn main() -> framelock::Result<()> {
//! let clock = GenlockClock::new(GenlockMode::Follower, "127.0.0.1:5960".parse()?, 60);
//! clock.initialize().await?;
//!
//! let now = clock.now();
//! let boundary = clock.next_frame_boundary(now, framelock::types::frame_period_ns(60));
//! assert!(boundary > now);
//! # Ok(())
//! # }
//! ```

mod follower;
mod reference;
mod state;

pub use state::{OFFSET_SMOOTHING, SyncState};

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GenlockConfig;
use crate::types::{GenlockMode, PeerAddress, SyncStats, TIMECODE_SYNTHESIZE, frame_period_ns};
use crate::{FrameLockError, Result};

/// Default recency window for the follower's synchronized state.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(200);

/// Local time in nanoseconds on the host's monotonic clock.
///
/// Processes on one host share this epoch, so co-located reference and
/// followers measure offsets close to zero. Elapsed time is read through
/// tokio so paused-time tests drive it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalClock {
    epoch: Instant,
    base_ns: i64,
}

impl LocalClock {
    pub(crate) fn new() -> Self {
        Self { epoch: Instant::now(), base_ns: monotonic_base_ns() }
    }

    pub(crate) fn now_ns(&self) -> i64 {
        let elapsed = i64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.base_ns.saturating_add(elapsed)
    }

    /// Tokio instant corresponding to `ns` on this clock.
    pub(crate) fn instant_at(&self, ns: i64) -> Instant {
        self.epoch + Duration::from_nanos(ns.saturating_sub(self.base_ns).max(0) as u64)
    }
}

#[cfg(unix)]
fn monotonic_base_ns() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: clock_gettime only writes into the timespec we own
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc == 0 {
        (ts.tv_sec as i64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as i64)
    } else {
        wall_clock_ns()
    }
}

#[cfg(not(unix))]
fn monotonic_base_ns() -> i64 {
    wall_clock_ns()
}

fn wall_clock_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// State shared between the engine handle and its network task.
#[derive(Debug)]
pub(crate) struct Shared {
    state: RwLock<SyncState>,
}

impl Shared {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, SyncState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SyncState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Running network task of a reference or follower.
struct SyncSession {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Genlock clock for frame-accurate multi-process synchronization.
pub struct GenlockClock {
    clock: LocalClock,
    shared: Arc<Shared>,
    peer: Mutex<PeerAddress>,
    session: Mutex<Option<SyncSession>>,
    /// Serializes initialize/shutdown/reconfiguration
    lifecycle: tokio::sync::Mutex<()>,
}

impl GenlockClock {
    /// Create an engine; no socket is opened until [`initialize`](Self::initialize).
    pub fn new(mode: GenlockMode, peer: PeerAddress, fps: u32) -> Self {
        Self::with_sync_timeout(mode, peer, fps, DEFAULT_SYNC_TIMEOUT)
    }

    pub fn with_sync_timeout(
        mode: GenlockMode,
        peer: PeerAddress,
        fps: u32,
        sync_timeout: Duration,
    ) -> Self {
        let timeout_ns = i64::try_from(sync_timeout.as_nanos()).unwrap_or(i64::MAX);
        Self {
            clock: LocalClock::new(),
            shared: Arc::new(Shared { state: RwLock::new(SyncState::new(mode, fps, timeout_ns)) }),
            peer: Mutex::new(peer),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &GenlockConfig, fps: u32) -> Self {
        Self::with_sync_timeout(config.mode, config.peer, fps, config.sync_timeout())
    }

    /// Open the socket and start the network task for the current mode.
    ///
    /// Idempotent. A bind failure is returned and leaves the engine inactive.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_session()
    }

    /// Stop the network task and close its socket. Idempotent.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_session().await;
    }

    /// Switch mode, recreating network resources if the engine was running.
    pub async fn set_mode(&self, mode: GenlockMode) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let (current, was_active) = {
            let state = self.shared.read();
            (state.mode, state.active)
        };
        if current == mode {
            return Ok(());
        }

        info!(from = %current, to = %mode, "Changing genlock mode");
        self.stop_session().await;
        {
            let mut state = self.shared.write();
            state.mode = mode;
            state.reset_estimate();
        }

        if was_active { self.start_session() } else { Ok(()) }
    }

    /// Change the peer address, rebinding if a network session is running.
    pub async fn set_peer_address(&self, peer: PeerAddress) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if *self.peer.lock().unwrap_or_else(PoisonError::into_inner) == peer {
            return Ok(());
        }

        let (mode, was_active) = {
            let state = self.shared.read();
            (state.mode, state.active)
        };
        let restart = was_active && mode.uses_network();
        if restart {
            self.stop_session().await;
        }

        info!(%peer, "Changing genlock peer address");
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = peer;
        self.shared.write().reset_estimate();

        if restart { self.start_session() } else { Ok(()) }
    }

    /// Current time on the genlock timeline, in nanoseconds.
    ///
    /// A synchronized follower returns reference time; every other state returns
    /// the local clock.
    pub fn now(&self) -> i64 {
        let local = self.clock.now_ns();
        local - self.shared.read().applied_offset_ns(local)
    }

    /// First frame boundary strictly after `current_ns`, aligned to the epoch.
    pub fn next_frame_boundary(&self, current_ns: i64, frame_period_ns: i64) -> i64 {
        next_frame_boundary(current_ns, frame_period_ns)
    }

    /// Timecode in 100ns units, or the synthesize sentinel when genlock is off.
    pub fn timecode(&self) -> i64 {
        self.timecode_at(self.now())
    }

    /// Timecode for a point on the genlock timeline, such as a frame boundary.
    pub fn timecode_at(&self, time_ns: i64) -> i64 {
        let active = {
            let state = self.shared.read();
            state.active && state.mode.uses_network()
        };
        if active { time_ns / 100 } else { TIMECODE_SYNTHESIZE }
    }

    pub fn is_synchronized(&self) -> bool {
        self.shared.read().is_synchronized_at(self.clock.now_ns())
    }

    /// Applied follower offset in microseconds; zero when not synchronized.
    pub fn offset_microseconds(&self) -> i64 {
        self.shared.read().applied_offset_ns(self.clock.now_ns()) / 1_000
    }

    pub fn mode(&self) -> GenlockMode {
        self.shared.read().mode
    }

    pub fn peer_address(&self) -> PeerAddress {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fps(&self) -> u32 {
        self.shared.read().fps
    }

    pub fn frame_period_ns(&self) -> i64 {
        frame_period_ns(self.fps())
    }

    pub fn get_stats(&self) -> SyncStats {
        self.shared.read().snapshot(self.clock.now_ns())
    }

    /// Tokio instant at which this clock's `now()` reaches `target_ns`.
    pub(crate) fn deadline_for(&self, target_ns: i64) -> Instant {
        let remaining = target_ns.saturating_sub(self.now()).max(0);
        Instant::now() + Duration::from_nanos(remaining as u64)
    }

    fn start_session(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let (mode, fps) = {
            let state = self.shared.read();
            if state.active {
                return Ok(());
            }
            (state.mode, state.fps)
        };
        let peer = self.peer_address();

        let handle = match mode {
            GenlockMode::Disabled => {
                debug!("Genlock disabled");
                None
            }
            GenlockMode::Reference => {
                let socket = bind_reference_socket(peer)?;
                Some(reference::spawn(socket, peer, fps, self.clock, Arc::clone(&self.shared)))
            }
            GenlockMode::Follower => {
                let socket = bind_follower_socket(peer)?;
                Some(follower::spawn(socket, self.clock, Arc::clone(&self.shared)))
            }
        };

        *session = handle.map(|(cancel, handle)| SyncSession { cancel, handle });
        self.shared.write().active = true;
        info!(%mode, %peer, fps, "Genlock initialized");
        Ok(())
    }

    async fn stop_session(&self) {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(session) = session {
            debug!("Shutting down genlock session");
            session.cancel.cancel();
            if let Err(e) = session.handle.await {
                warn!("Genlock task ended abnormally: {}", e);
            }
        }

        let mut state = self.shared.write();
        if state.active {
            state.active = false;
            state.reset_estimate();
            debug!("Genlock shutdown complete");
        }
    }
}

impl Drop for GenlockClock {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = session.take() {
            session.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for GenlockClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.read();
        f.debug_struct("GenlockClock")
            .field("mode", &state.mode)
            .field("active", &state.active)
            .field("fps", &state.fps)
            .field("peer", &self.peer_address())
            .finish()
    }
}

/// First multiple of `period_ns` strictly greater than `current_ns`.
pub fn next_frame_boundary(current_ns: i64, period_ns: i64) -> i64 {
    if period_ns <= 0 {
        return current_ns;
    }
    (current_ns.div_euclid(period_ns) + 1).saturating_mul(period_ns)
}

fn unspecified_for(peer: PeerAddress, port: u16) -> SocketAddr {
    match peer.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// UDP socket bound to `addr` with address (and on unix, port) reuse, so that
/// several workers on one host can listen on a shared genlock port.
fn reusable_socket(addr: SocketAddr) -> Result<Socket> {
    let bind_error = |e: std::io::Error| FrameLockError::bind_failed(addr, e);
    let socket =
        Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    Ok(socket)
}

fn into_tokio(socket: Socket, addr: SocketAddr) -> Result<UdpSocket> {
    socket.set_nonblocking(true).map_err(|e| FrameLockError::bind_failed(addr, e))?;
    UdpSocket::from_std(socket.into()).map_err(|e| FrameLockError::bind_failed(addr, e))
}

fn bind_reference_socket(peer: PeerAddress) -> Result<UdpSocket> {
    let addr = unspecified_for(peer, 0);
    let socket = reusable_socket(addr)?;

    if peer.is_broadcast() {
        socket
            .set_broadcast(true)
            .map_err(|e| FrameLockError::transport("enabling SO_BROADCAST", e))?;
    }

    into_tokio(socket, addr)
}

fn bind_follower_socket(peer: PeerAddress) -> Result<UdpSocket> {
    let addr = unspecified_for(peer, peer.port());
    let socket = reusable_socket(addr)?;

    match peer.ip() {
        IpAddr::V4(group) if group.is_multicast() => socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| FrameLockError::transport(format!("joining multicast {}", group), e))?,
        IpAddr::V6(group) if group.is_multicast() => socket
            .join_multicast_v6(&group, 0)
            .map_err(|e| FrameLockError::transport(format!("joining multicast {}", group), e))?,
        _ => {}
    }

    into_tokio(socket, addr)
}
