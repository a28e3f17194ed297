//! Frame types passed between pipeline stages.
//!
//! These never leave the process. The wire representation is
//! [`crate::packet::Frame`].

use std::time::Instant;

use bytes::Bytes;

/// Pixel layout of captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 => 4,
        }
    }
}

/// One acquisition from a [`FrameSource`](super::capture::FrameSource).
///
/// `pixels` holds `height` rows of `stride` bytes. `stride` may exceed
/// `width * 4` when the source pads rows.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub pixels: Bytes,
    /// `false` when the screen did not change since the previous acquire.
    pub changed: bool,
    pub captured_at: Instant,
}

impl CapturedFrame {
    /// Size of the raw bitmap as described by the dimensions.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// A capture result tagged with the sequence number it will travel under.
#[derive(Debug, Clone)]
pub struct SequencedFrame {
    pub sequence: u16,
    pub frame: CapturedFrame,
}

/// Codec output for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub data: Bytes,
    pub keyframe: bool,
    /// `false` when the codec passed the pixels through untouched.
    pub compressed: bool,
}

/// A frame ready for presentation, as queued for the render worker.
#[derive(Debug, Clone)]
pub struct RenderFrame {
    pub sequence: u16,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixels: Bytes,
}

impl From<SequencedFrame> for RenderFrame {
    fn from(value: SequencedFrame) -> Self {
        Self {
            sequence: value.sequence,
            width: value.frame.width,
            height: value.frame.height,
            stride: value.frame.stride,
            pixels: value.frame.pixels,
        }
    }
}
