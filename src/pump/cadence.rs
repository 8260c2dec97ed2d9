//! Per-boundary delivery decisions and rate measurement

use std::time::Duration;
use tokio::time::Instant;

/// What happened on one cadence boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Exactly one new frame arrived and was forwarded
    Sent,
    /// Several frames arrived; older ones were discarded and the newest forwarded
    Dropped,
    /// No new frame; the previous frame (if any) was repeated
    Held,
}

impl TickOutcome {
    pub fn is_new_frame(self) -> bool {
        !matches!(self, TickOutcome::Held)
    }
}

/// Tracks the last delivered sequence number to classify each boundary.
#[derive(Debug, Clone, Default)]
pub struct CadenceState {
    last_sequence: u64,
}

impl CadenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a boundary given the newest frame taken from the slots.
    pub fn classify(&mut self, latest: Option<u64>) -> TickOutcome {
        match latest {
            Some(sequence) if sequence > self.last_sequence => {
                let arrived = sequence - self.last_sequence;
                self.last_sequence = sequence;
                if arrived > 1 { TickOutcome::Dropped } else { TickOutcome::Sent }
            }
            _ => TickOutcome::Held,
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// New-frame rate measured over one-second windows.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window_start: Instant,
    frames: u32,
    fps: f32,
}

impl FpsMeter {
    pub fn new(now: Instant) -> Self {
        Self { window_start: now, frames: 0, fps: 0.0 }
    }

    /// Record one boundary; returns the updated rate when a window closes.
    pub fn record(&mut self, now: Instant, new_frame: bool) -> Option<f32> {
        if new_frame {
            self.frames += 1;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < FPS_WINDOW {
            return None;
        }

        self.fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(self.fps)
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn classifies_single_multiple_and_missing_arrivals() {
        let mut cadence = CadenceState::new();
        assert_eq!(cadence.classify(None), TickOutcome::Held);
        assert_eq!(cadence.classify(Some(1)), TickOutcome::Sent);
        assert_eq!(cadence.classify(None), TickOutcome::Held);
        assert_eq!(cadence.classify(Some(4)), TickOutcome::Dropped);
        assert_eq!(cadence.classify(Some(5)), TickOutcome::Sent);
        assert_eq!(cadence.last_sequence(), 5);
    }

    #[test]
    fn stale_sequence_counts_as_held() {
        let mut cadence = CadenceState::new();
        cadence.classify(Some(3));
        assert_eq!(cadence.classify(Some(3)), TickOutcome::Held);
    }

    #[tokio::test(start_paused = true)]
    async fn meter_reports_new_frames_per_second() {
        let start = Instant::now();
        let mut meter = FpsMeter::new(start);
        let period = Duration::from_millis(20);

        let mut reported = None;
        for i in 1..=50u32 {
            // Every other boundary carries a new frame: 25 of 50
            reported = meter.record(start + period * i, i % 2 == 0).or(reported);
        }

        let fps = reported.expect("window closed after one second");
        assert!((fps - 25.0).abs() < 0.01, "fps {}", fps);
        assert_eq!(meter.fps(), fps);
    }

    proptest! {
        #[test]
        fn every_boundary_is_classified_exactly_once(
            arrivals in prop::collection::vec(0u64..4, 1..200),
        ) {
            let mut cadence = CadenceState::new();
            let mut published = 0u64;
            let (mut sent, mut dropped, mut held) = (0u64, 0u64, 0u64);

            for count in &arrivals {
                published += count;
                let latest = (*count > 0).then_some(published);
                match cadence.classify(latest) {
                    TickOutcome::Sent => sent += 1,
                    TickOutcome::Dropped => dropped += 1,
                    TickOutcome::Held => held += 1,
                }
            }

            prop_assert_eq!(sent + dropped + held, arrivals.len() as u64);
            prop_assert_eq!(held, arrivals.iter().filter(|c| **c == 0).count() as u64);
            prop_assert_eq!(dropped, arrivals.iter().filter(|c| **c > 1).count() as u64);
        }
    }
}
