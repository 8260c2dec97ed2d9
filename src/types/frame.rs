//! Video frame and colour metadata types exchanged with the frame sink

use serde::{Deserialize, Serialize};

/// Bytes per pixel of the RGBA buffers pushed by the frame source.
pub const BYTES_PER_PIXEL: usize = 4;

/// Timecode value asking the transport to synthesize its own timecode.
pub const TIMECODE_SYNTHESIZE: i64 = i64::MAX;

/// Byte length of an RGBA frame with the given dimensions.
pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// A frame handed to the sink at a cadence boundary.
///
/// Borrows the delivery slot; the sink must copy if it keeps the pixels.
#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    /// RGBA pixels, `width * height * 4` bytes
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Frame rate numerator/denominator announced to receivers
    pub frame_rate_n: u32,
    pub frame_rate_d: u32,
    /// Presentation time on the genlock timeline, in nanoseconds
    pub timestamp_ns: i64,
    /// Timecode in 100ns units, or [`TIMECODE_SYNTHESIZE`]
    pub timecode: i64,
    /// Source sequence number of the pixels
    pub sequence: u64,
    /// True when the same pixels were already delivered on an earlier boundary
    pub repeated: bool,
}

impl VideoFrame<'_> {
    pub fn line_stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 { 0.0 } else { self.width as f32 / self.height as f32 }
    }
}

/// Colour primaries announced with every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    /// BT.709 (HD standard)
    #[default]
    Rec709,
    /// BT.2020 (UHD/HDR)
    Rec2020,
    /// sRGB (web standard)
    #[serde(rename = "srgb")]
    Srgb,
    /// BT.601 (SD legacy)
    Rec601,
}

impl ColorSpace {
    pub fn name(self) -> &'static str {
        match self {
            ColorSpace::Rec709 => "Rec. 709",
            ColorSpace::Rec2020 => "Rec. 2020",
            ColorSpace::Srgb => "sRGB",
            ColorSpace::Rec601 => "Rec. 601",
        }
    }
}

/// Transfer function announced with every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GammaMode {
    #[default]
    Bt709,
    Bt2020,
    #[serde(rename = "srgb")]
    Srgb,
    Linear,
}

impl GammaMode {
    pub fn name(self) -> &'static str {
        match self {
            GammaMode::Bt709 => "BT.709",
            GammaMode::Bt2020 => "BT.2020",
            GammaMode::Srgb => "sRGB",
            GammaMode::Linear => "Linear",
        }
    }
}

/// Quantisation range of the pixel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorRange {
    /// 0-255 (PC/web)
    #[default]
    Full,
    /// 16-235 (broadcast)
    Limited,
}

impl ColorRange {
    pub fn name(self) -> &'static str {
        match self {
            ColorRange::Full => "Full",
            ColorRange::Limited => "Limited",
        }
    }
}

/// Out-of-band colour description set on the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorMetadata {
    pub color_space: ColorSpace,
    pub gamma: GammaMode,
    pub range: ColorRange,
}

/// Program/preview on-air indication reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tally {
    pub on_program: bool,
    pub on_preview: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_geometry() {
        assert_eq!(frame_len(1920, 1080), 1920 * 1080 * 4);
        let data = vec![0u8; frame_len(4, 2)];
        let frame = VideoFrame {
            data: &data,
            width: 4,
            height: 2,
            frame_rate_n: 60,
            frame_rate_d: 1,
            timestamp_ns: 0,
            timecode: TIMECODE_SYNTHESIZE,
            sequence: 1,
            repeated: false,
        };
        assert_eq!(frame.line_stride(), 16);
        assert!((frame.aspect_ratio() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn color_names_match_broadcast_conventions() {
        let meta = ColorMetadata::default();
        assert_eq!(meta.color_space.name(), "Rec. 709");
        assert_eq!(meta.gamma.name(), "BT.709");
        assert_eq!(meta.range.name(), "Full");
        assert_eq!(ColorSpace::Srgb.name(), "sRGB");
    }

    #[test]
    fn color_metadata_from_yaml() {
        let meta: ColorMetadata =
            serde_yaml_ng::from_str("color_space: Rec2020\nrange: Limited").unwrap();
        assert_eq!(meta.color_space, ColorSpace::Rec2020);
        assert_eq!(meta.gamma, GammaMode::Bt709);
        assert_eq!(meta.range, ColorRange::Limited);
    }
}
