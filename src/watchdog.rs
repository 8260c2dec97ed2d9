//! Liveness watchdog
//!
//! Runs on its own OS thread so that a hung control loop, or a stalled async
//! runtime, cannot keep it from firing. The monitored loop calls
//! [`Watchdog::heartbeat`] on every iteration; if no heartbeat arrives within
//! the timeout the watchdog executes its action. The default action aborts the
//! process so that the supervisor observes an unexpected exit and restarts it.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::WatchdogConfig;
use crate::{FrameLockError, Result};

/// Lifecycle of a [`Watchdog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Armed,
    /// The timeout elapsed and the action ran; terminal
    Triggered,
}

impl WatchdogState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WatchdogState::Armed,
            2 => WatchdogState::Triggered,
            _ => WatchdogState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WatchdogState::Idle => 0,
            WatchdogState::Armed => 1,
            WatchdogState::Triggered => 2,
        }
    }
}

/// What happens when the timeout elapses.
#[derive(Default)]
pub enum WatchdogAction {
    /// Abort the process
    #[default]
    Abort,
    /// Invoke a callback on the watchdog thread
    Callback(Box<dyn Fn() + Send + Sync>),
}

impl fmt::Debug for WatchdogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogAction::Abort => f.write_str("Abort"),
            WatchdogAction::Callback(_) => f.write_str("Callback"),
        }
    }
}

struct Shared {
    timeout: Duration,
    poll_interval: Duration,
    action: WatchdogAction,
    epoch: Instant,
    /// Microseconds since `epoch`
    last_heartbeat_us: AtomicU64,
    state: AtomicU8,
    stop_requested: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn elapsed_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn time_since_heartbeat(&self) -> Duration {
        let last = self.last_heartbeat_us.load(Ordering::Acquire);
        Duration::from_micros(self.elapsed_us().saturating_sub(last))
    }

    fn lock_stop(&self) -> MutexGuard<'_, bool> {
        self.stop_requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> WatchdogState {
        WatchdogState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WatchdogState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Hung-loop detector.
pub struct Watchdog {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(timeout: Duration, action: WatchdogAction) -> Self {
        Self::with_poll_interval(timeout, Self::DEFAULT_POLL_INTERVAL, action)
    }

    pub fn with_poll_interval(
        timeout: Duration,
        poll_interval: Duration,
        action: WatchdogAction,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                timeout,
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                action,
                epoch: Instant::now(),
                last_heartbeat_us: AtomicU64::new(0),
                state: AtomicU8::new(WatchdogState::Idle.as_u8()),
                stop_requested: Mutex::new(false),
                wake: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn from_config(config: &WatchdogConfig, action: WatchdogAction) -> Self {
        Self::with_poll_interval(config.timeout(), config.poll_interval(), action)
    }

    /// Arm the watchdog and start its timer thread.
    ///
    /// Counts as a heartbeat. Idempotent while armed; a triggered watchdog
    /// cannot be re-armed.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        match self.shared.state() {
            WatchdogState::Armed => return Ok(()),
            WatchdogState::Triggered => {
                return Err(FrameLockError::invalid_config(
                    "watchdog",
                    "a triggered watchdog cannot be restarted",
                ));
            }
            WatchdogState::Idle => {}
        }

        // Reap a thread left over from an earlier start/stop cycle
        if let Some(old) = thread.take() {
            let _ = old.join();
        }

        *self.shared.lock_stop() = false;
        self.heartbeat();
        self.shared.set_state(WatchdogState::Armed);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || run(shared))
            .map_err(|e| {
                self.shared.set_state(WatchdogState::Idle);
                FrameLockError::io("spawning watchdog thread", e)
            })?;

        info!(timeout_ms = self.shared.timeout.as_millis() as u64, "Watchdog armed");
        *thread = Some(handle);
        Ok(())
    }

    /// Disarm and join the timer thread. Idempotent.
    pub fn stop(&self) {
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        {
            let mut stop = self.shared.lock_stop();
            *stop = true;
            self.shared.wake.notify_all();
        }

        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Stopped from inside the timeout callback; the thread exits on its own
                debug!("Watchdog stopped from its own thread");
            } else if handle.join().is_err() {
                error!("Watchdog thread panicked");
            }
        }

        if self.shared.state() == WatchdogState::Armed {
            self.shared.set_state(WatchdogState::Idle);
            debug!("Watchdog disarmed");
        }
    }

    /// Record that the monitored loop is alive.
    pub fn heartbeat(&self) {
        self.shared.last_heartbeat_us.store(self.shared.elapsed_us(), Ordering::Release);
    }

    pub fn time_since_heartbeat(&self) -> Duration {
        self.shared.time_since_heartbeat()
    }

    pub fn state(&self) -> WatchdogState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WatchdogState::Armed
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout", &self.shared.timeout)
            .field("state", &self.state())
            .field("action", &self.shared.action)
            .finish()
    }
}

fn run(shared: Arc<Shared>) {
    debug!("Watchdog thread started");

    loop {
        // Decided under the stop lock: a stop() either lands first or sees Triggered
        let elapsed = {
            let stop = shared.lock_stop();
            let (stop, _) = shared
                .wake
                .wait_timeout_while(stop, shared.poll_interval, |stop| !*stop)
                .unwrap_or_else(PoisonError::into_inner);
            if *stop {
                break;
            }

            let elapsed = shared.time_since_heartbeat();
            if elapsed <= shared.timeout {
                continue;
            }
            shared.set_state(WatchdogState::Triggered);
            elapsed
        };

        error!(
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = shared.timeout.as_millis() as u64,
            "Watchdog timeout: control loop stopped sending heartbeats"
        );
        match &shared.action {
            WatchdogAction::Abort => {
                error!("Main loop hung, aborting process");
                std::process::abort();
            }
            WatchdogAction::Callback(callback) => callback(),
        }
        break;
    }

    debug!("Watchdog thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_watchdog(timeout_ms: u64) -> (Watchdog, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::with_poll_interval(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(5),
            WatchdogAction::Callback(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        (watchdog, fired)
    }

    #[test]
    fn fires_once_without_heartbeats() {
        let _ = tracing_subscriber::fmt::try_init();
        let (watchdog, fired) = counting_watchdog(30);
        watchdog.start().unwrap();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.state(), WatchdogState::Triggered);
        assert!(watchdog.time_since_heartbeat() >= Duration::from_millis(30));
    }

    #[test]
    fn heartbeats_keep_it_armed() {
        let (watchdog, fired) = counting_watchdog(100);
        watchdog.start().unwrap();

        for _ in 0..15 {
            thread::sleep(Duration::from_millis(10));
            watchdog.heartbeat();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_running());
        assert!(watchdog.time_since_heartbeat() < Duration::from_millis(100));
        watchdog.stop();
    }

    #[test]
    fn stop_cancels_pending_trigger() {
        let (watchdog, fired) = counting_watchdog(50);
        watchdog.start().unwrap();
        watchdog.stop();
        watchdog.stop();

        assert_eq!(watchdog.state(), WatchdogState::Idle);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn can_rearm_after_stop() {
        let (watchdog, fired) = counting_watchdog(40);
        watchdog.start().unwrap();
        watchdog.stop();
        watchdog.start().unwrap();
        watchdog.start().unwrap();
        assert!(watchdog.is_running());

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(watchdog.start().is_err());
    }

    #[test]
    fn stop_requested_while_armed_never_fires() {
        for round in 0..40u64 {
            let (watchdog, fired) = counting_watchdog(1);
            watchdog.start().unwrap();
            thread::sleep(Duration::from_micros(round * 150));

            let armed_at_request = {
                let mut stop = watchdog.shared.lock_stop();
                *stop = true;
                watchdog.shared.wake.notify_all();
                watchdog.shared.state() == WatchdogState::Armed
            };
            watchdog.stop();

            if armed_at_request {
                assert_eq!(fired.load(Ordering::SeqCst), 0, "fired after stop in round {}", round);
                assert_eq!(watchdog.state(), WatchdogState::Idle);
            } else {
                assert_eq!(fired.load(Ordering::SeqCst), 1);
                assert_eq!(watchdog.state(), WatchdogState::Triggered);
            }
        }
    }

    #[test]
    fn stop_wakes_a_long_poll() {
        let watchdog = Watchdog::with_poll_interval(
            Duration::from_secs(60),
            Duration::from_secs(30),
            WatchdogAction::Callback(Box::new(|| {})),
        );
        watchdog.start().unwrap();

        let started = Instant::now();
        watchdog.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn idle_watchdog_reports_state() {
        let watchdog = Watchdog::new(Duration::from_secs(30), WatchdogAction::default());
        assert_eq!(watchdog.state(), WatchdogState::Idle);
        assert!(!watchdog.is_running());
        assert_eq!(watchdog.timeout(), Duration::from_secs(30));
        assert_eq!(format!("{:?}", WatchdogAction::default()), "Abort");
    }
}
