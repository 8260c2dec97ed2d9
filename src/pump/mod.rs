//! Frame delivery scheduler (frame pump)
//!
//! The renderer pushes frames whenever they finish; the pump forwards them to
//! the [`FrameSink`] on a fixed cadence taken from the [`GenlockClock`]. At
//! every frame boundary the pump takes the newest completed frame:
//!
//! - one new frame since the last boundary: forwarded, counted as *sent*
//! - several new frames: the older ones were overwritten before delivery and
//!   the newest is forwarded, counted as *dropped*
//! - no new frame: the previous frame is repeated, counted as *held*
//!
//! Each boundary is counted exactly once, so `sent + dropped + held` always
//! equals the number of boundaries since [`FramePump::start`]. Boundaries the
//! loop could not service in time (a slow sink, a forward clock step) are
//! counted as held without a delivery.

mod cadence;
mod slots;

pub use cadence::{CadenceState, FpsMeter, TickOutcome};
pub use slots::{FrameSlot, FrameSlots};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PumpConfig;
use crate::genlock::GenlockClock;
use crate::sink::FrameSink;
use crate::types::{ColorMetadata, FrameStats, VideoFrame, frame_period_ns};

struct PumpTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct PumpInner {
    clock: Arc<GenlockClock>,
    sink: Arc<dyn FrameSink>,
    slots: FrameSlots,
    fps: u32,
    color: ColorMetadata,
    running: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
    held: AtomicU64,
    sink_errors: AtomicU64,
    /// f32 bits of the last measured rate
    current_fps: AtomicU32,
}

impl PumpInner {
    fn record(&self, outcome: TickOutcome) {
        let counter = match outcome {
            TickOutcome::Sent => &self.sent,
            TickOutcome::Dropped => &self.dropped,
            TickOutcome::Held => &self.held,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Boundaries that passed while the loop was late count as held.
    fn record_missed(&self, missed: u64) {
        self.held.fetch_add(missed, Ordering::Relaxed);
    }

    /// Hand the front slot to the sink for the boundary at `boundary_ns`.
    fn deliver(&self, boundary_ns: i64, outcome: TickOutcome) {
        let timecode = self.clock.timecode_at(boundary_ns);
        let result = self.slots.with_front(|slot| {
            if slot.is_empty() {
                return None;
            }
            let frame = VideoFrame {
                data: slot.data(),
                width: slot.width(),
                height: slot.height(),
                frame_rate_n: self.fps,
                frame_rate_d: 1,
                timestamp_ns: boundary_ns,
                timecode,
                sequence: slot.sequence(),
                repeated: outcome == TickOutcome::Held,
            };
            Some(self.sink.send_video(&frame))
        });

        if let Some(Err(e)) = result {
            let errors = self.sink_errors.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(errors, "Frame sink rejected frame: {}", e);
        }
    }
}

/// Fixed-cadence frame scheduler.
pub struct FramePump {
    inner: Arc<PumpInner>,
    task: Mutex<Option<PumpTask>>,
}

impl FramePump {
    /// Create a pump with slots pre-sized for the configured resolution.
    pub fn new(clock: Arc<GenlockClock>, sink: Arc<dyn FrameSink>, config: &PumpConfig) -> Self {
        Self {
            inner: Arc::new(PumpInner {
                clock,
                sink,
                slots: FrameSlots::new(config.width, config.height),
                fps: config.fps.max(1),
                color: config.color,
                running: AtomicBool::new(false),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                held: AtomicU64::new(0),
                sink_errors: AtomicU64::new(0),
                current_fps: AtomicU32::new(0f32.to_bits()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the cadence loop on the current Tokio runtime. Idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        self.inner.sink.set_color_metadata(self.inner.color);
        self.inner.running.store(true, Ordering::Release);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            run(inner, task_cancel).await;
        });

        info!(
            fps = self.inner.fps,
            color_space = self.inner.color.color_space.name(),
            "Frame pump started"
        );
        *task = Some(PumpTask { cancel, handle });
    }

    /// Stop the cadence loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            return;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("Frame pump task ended abnormally: {}", e);
        }
        info!(stats = ?self.stats(), "Frame pump stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Offer a new RGBA frame; ignored (returns false) while the pump is stopped
    /// or when `pixels` is shorter than `width * height * 4`.
    pub fn submit_frame(&self, pixels: &[u8], width: u32, height: u32) -> bool {
        submit(&self.inner, pixels, width, height)
    }

    /// Cloneable handle for the frame-source callback context.
    pub fn submitter(&self) -> FrameSubmitter {
        FrameSubmitter { inner: Arc::clone(&self.inner) }
    }

    /// New-frame rate over the last one-second window.
    pub fn current_fps(&self) -> f32 {
        f32::from_bits(self.inner.current_fps.load(Ordering::Relaxed))
    }

    /// Copy the frame most recently handed to the sink into `out`.
    pub fn get_current_frame(&self, out: &mut Vec<u8>) -> Option<(u32, u32)> {
        self.inner.slots.copy_front(out)
    }

    pub fn frames_sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn frames_held(&self) -> u64 {
        self.inner.held.load(Ordering::Relaxed)
    }

    pub fn sink_errors(&self) -> u64 {
        self.inner.sink_errors.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            sent: self.frames_sent(),
            dropped: self.frames_dropped(),
            held: self.frames_held(),
        }
    }

    pub fn target_fps(&self) -> u32 {
        self.inner.fps
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for FramePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePump")
            .field("fps", &self.inner.fps)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Frame-source side of a [`FramePump`].
#[derive(Clone)]
pub struct FrameSubmitter {
    inner: Arc<PumpInner>,
}

impl FrameSubmitter {
    pub fn submit_frame(&self, pixels: &[u8], width: u32, height: u32) -> bool {
        submit(&self.inner, pixels, width, height)
    }
}

impl std::fmt::Debug for FrameSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSubmitter").finish_non_exhaustive()
    }
}

fn submit(inner: &PumpInner, pixels: &[u8], width: u32, height: u32) -> bool {
    if !inner.running.load(Ordering::Acquire) {
        return false;
    }
    match inner.slots.publish(pixels, width, height) {
        Some(sequence) => {
            trace!(sequence, width, height, "Frame submitted");
            true
        }
        None => {
            debug!(len = pixels.len(), width, height, "Rejected malformed frame");
            false
        }
    }
}

/// Cadence loop: sleep to each boundary, classify it, deliver.
async fn run(inner: Arc<PumpInner>, cancel: CancellationToken) {
    let period = frame_period_ns(inner.fps);
    let mut cadence = CadenceState::new();
    let mut meter = FpsMeter::new(Instant::now());
    let mut last_boundary: Option<i64> = None;

    debug!(period_ns = period, "Frame pump loop started");

    loop {
        let mut boundary = inner.clock.next_frame_boundary(inner.clock.now(), period);
        // A follower's clock can step backwards when its offset estimate moves
        if let Some(last) = last_boundary.filter(|last| boundary <= *last) {
            boundary = last.saturating_add(period);
        }

        let deadline = inner.clock.deadline_for(boundary);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        if let Some(last) = last_boundary {
            let missed = (boundary - last) / period - 1;
            if missed > 0 {
                inner.record_missed(missed as u64);
                debug!(missed, boundary, "Frame pump fell behind its cadence");
            }
        }
        last_boundary = Some(boundary);

        let outcome = cadence.classify(inner.slots.take_latest());
        inner.record(outcome);
        inner.deliver(boundary, outcome);

        if let Some(fps) = meter.record(Instant::now(), outcome.is_new_frame()) {
            inner.current_fps.store(fps.to_bits(), Ordering::Relaxed);
            trace!(fps, "Measured output rate");
        }
    }

    debug!(last_sequence = cadence.last_sequence(), "Frame pump loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSink;
    use crate::types::{GenlockMode, PeerAddress, TIMECODE_SYNTHESIZE, frame_len};
    use std::time::Duration;

    fn pump_with_sink(fps: u32) -> (FramePump, Arc<RecordingSink>) {
        let clock = Arc::new(GenlockClock::new(GenlockMode::Disabled, PeerAddress::default(), fps));
        let sink = Arc::new(RecordingSink::new());
        let config = PumpConfig { width: 4, height: 4, fps, ..Default::default() };
        (FramePump::new(clock, sink.clone(), &config), sink)
    }

    fn frame(value: u8) -> Vec<u8> {
        vec![value; frame_len(4, 4)]
    }

    #[tokio::test(start_paused = true)]
    async fn idle_source_only_holds() {
        let _ = tracing_subscriber::fmt::try_init();
        let (pump, sink) = pump_with_sink(60);
        pump.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let first = pump.stats();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pump.stop().await;
        let second = pump.stats();

        assert!(first.held > 0);
        assert!(second.held > first.held);
        assert_eq!(second.sent, 0);
        assert_eq!(second.dropped, 0);
        assert_eq!(sink.deliveries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_boundary_is_delivered_once_a_frame_exists() {
        let (pump, sink) = pump_with_sink(60);
        pump.start();
        assert!(pump.submit_frame(&frame(1), 4, 4));

        tokio::time::sleep(Duration::from_millis(500)).await;
        pump.stop().await;

        let stats = pump.stats();
        assert_eq!(stats.ticks(), sink.deliveries() as u64);
        assert!((28..=32).contains(&stats.ticks()), "ticks {}", stats.ticks());
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.held, stats.ticks() - 1);

        let records = sink.records();
        assert!(!records[0].repeated);
        assert!(records[1..].iter().all(|r| r.repeated && r.sequence == 1));
        assert_eq!(records[0].timecode, TIMECODE_SYNTHESIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_timestamps_are_consecutive_boundaries() {
        let (pump, sink) = pump_with_sink(50);
        pump.start();
        pump.submit_frame(&frame(1), 4, 4);

        tokio::time::sleep(Duration::from_millis(300)).await;
        pump.stop().await;

        let period = frame_period_ns(50);
        let records = sink.records();
        assert!(records.len() > 5);
        for pair in records.windows(2) {
            assert_eq!(pair[1].timestamp_ns - pair[0].timestamp_ns, period);
            assert_eq!(pair[0].timestamp_ns.rem_euclid(period), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fast_source_drops_older_frames() {
        let (pump, sink) = pump_with_sink(60);
        pump.start();
        let submitter = pump.submitter();

        let source = tokio::spawn(async move {
            let mut value = 0u8;
            while submitter.submit_frame(&frame(value), 4, 4) {
                value = value.wrapping_add(1);
                tokio::time::sleep(Duration::from_millis(4)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        pump.stop().await;
        source.await.unwrap();

        let stats = pump.stats();
        assert!(stats.dropped > stats.sent, "{:?}", stats);
        assert_eq!(stats.ticks(), sink.deliveries() as u64);
        assert!(stats.drop_rate() > 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_holds_between_frames() {
        let (pump, _sink) = pump_with_sink(60);
        pump.start();
        let submitter = pump.submitter();

        let source = tokio::spawn(async move {
            while submitter.submit_frame(&frame(3), 4, 4) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        let fps = pump.current_fps();
        pump.stop().await;
        source.await.unwrap();

        let stats = pump.stats();
        assert_eq!(stats.dropped, 0);
        assert!(stats.held > stats.sent * 3, "{:?}", stats);
        assert!((8.0..=12.0).contains(&fps), "fps {}", fps);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn boundaries_missed_by_a_slow_sink_are_still_counted() {
        let (pump, sink) = pump_with_sink(60);
        sink.set_send_delay(Duration::from_millis(40));
        pump.start();
        assert!(pump.submit_frame(&frame(1), 4, 4));

        tokio::time::sleep(Duration::from_millis(600)).await;
        pump.stop().await;

        let period = frame_period_ns(60);
        let stats = pump.stats();
        let records = sink.records();
        let (first, last) = (&records[0], &records[records.len() - 1]);
        let elapsed = ((last.timestamp_ns - first.timestamp_ns) / period + 1) as u64;

        // The first boundary may come before the submit and be held empty
        let undelivered = stats.ticks() - elapsed;
        assert!(undelivered <= 1, "{:?} over {} boundaries", stats, elapsed);
        assert!(stats.ticks() > records.len() as u64 * 2, "{:?}", stats);
        assert_eq!(stats.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_is_ignored_while_stopped() {
        let (pump, _sink) = pump_with_sink(60);
        assert!(!pump.submit_frame(&frame(1), 4, 4));

        pump.start();
        pump.start();
        assert!(pump.is_running());
        assert!(!pump.submit_frame(&frame(1)[..10], 4, 4));

        pump.stop().await;
        pump.stop().await;
        assert!(!pump.is_running());
        assert!(!pump.submit_frame(&frame(1), 4, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn current_frame_is_the_delivered_one() {
        let (pump, sink) = pump_with_sink(60);
        let mut out = Vec::new();
        assert_eq!(pump.get_current_frame(&mut out), None);

        pump.start();
        pump.submit_frame(&frame(9), 4, 4);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(pump.get_current_frame(&mut out), Some((4, 4)));
        assert!(out.iter().all(|&b| b == 9));
        assert_eq!(sink.color(), Some(ColorMetadata::default()));
        pump.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sink_errors_do_not_stop_delivery() {
        let (pump, sink) = pump_with_sink(60);
        sink.fail_sends(true);
        pump.start();
        pump.submit_frame(&frame(1), 4, 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        pump.stop().await;

        assert!(pump.sink_errors() >= 5);
        assert_eq!(pump.sink_errors(), pump.stats().ticks());
    }
}
