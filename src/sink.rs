//! Frame sink trait for video transports

use crate::Result;
use crate::types::{ColorMetadata, Tally, VideoFrame};

/// Destination of paced frames (the video-transport layer)
///
/// Sinks are driven from the frame pump's cadence loop, once per frame
/// boundary. `send_video` should return promptly: time spent here is taken
/// from the next cadence period.
pub trait FrameSink: Send + Sync + 'static {
    /// Deliver one frame
    ///
    /// An error is logged and counted by the pump but does not stop delivery.
    fn send_video(&self, frame: &VideoFrame<'_>) -> Result<()>;

    /// Set colour metadata announced with subsequent frames
    fn set_color_metadata(&self, metadata: ColorMetadata);

    /// Number of receivers currently connected
    fn connection_count(&self) -> usize;

    /// Program/preview state reported by downstream switchers
    fn tally(&self) -> Tally {
        Tally::default()
    }
}

/// Sink that discards every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn send_video(&self, _frame: &VideoFrame<'_>) -> Result<()> {
        Ok(())
    }

    fn set_color_metadata(&self, _metadata: ColorMetadata) {}

    fn connection_count(&self) -> usize {
        0
    }
}
