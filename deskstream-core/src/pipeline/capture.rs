//! Screen capture contract and a synthetic source.
//!
//! Real capture (DXGI desktop duplication, PipeWire, ...) lives behind
//! [`FrameSource`]. [`TestPatternSource`] produces a deterministic moving
//! bar pattern so every mode runs without a display.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::error::StreamError;
use crate::pipeline::types::{CapturedFrame, PixelFormat};

// ── FrameSource ──────────────────────────────────────────────────

pub trait FrameSource: Send {
    /// Wait up to `timeout` for the next frame.
    ///
    /// `Timeout` means nothing new was ready, `ResourceLost` means the
    /// device must be re-initialised before the next call.
    fn acquire(&mut self, timeout: Duration) -> Result<CapturedFrame, StreamError>;

    /// Rebuild the device after `ResourceLost`.
    fn reinitialize(&mut self) -> Result<(), StreamError>;

    /// Current `(width, height)` in pixels.
    fn dimensions(&self) -> (u32, u32);

    fn release(&mut self);
}

// ── TestPatternSource ────────────────────────────────────────────

const BAR_WIDTH: u32 = 64;
const BAR_STEP: u32 = 8;

/// Vertical colour bars scrolling horizontally.
///
/// Every row of a frame is identical, so the output compresses to a few
/// kilobytes even at 1080p.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    acquired: u64,
    /// The pattern advances once every `motion_interval` acquires.
    motion_interval: u64,
    lose_device_at: Option<u64>,
    fail_reinitialize: bool,
    lost: bool,
    released: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Result<Self, StreamError> {
        if width == 0 || height == 0 {
            return Err(StreamError::init(
                "frame source",
                format!("invalid dimensions {width}x{height}"),
            ));
        }
        info!(width, height, "test pattern source ready");
        Ok(Self {
            width,
            height,
            acquired: 0,
            motion_interval: 1,
            lose_device_at: None,
            fail_reinitialize: false,
            lost: false,
            released: false,
        })
    }

    /// Only move the pattern every `interval` acquires; the frames in
    /// between are reported as unchanged.
    pub fn with_motion_interval(mut self, interval: u64) -> Self {
        self.motion_interval = interval.max(1);
        self
    }

    /// Report `ResourceLost` on the acquire with this zero-based index.
    pub fn with_device_loss_at(mut self, acquire_index: u64) -> Self {
        self.lose_device_at = Some(acquire_index);
        self
    }

    /// Make every `reinitialize` call fail.
    pub fn with_failing_reinitialize(mut self) -> Self {
        self.fail_reinitialize = true;
        self
    }

    pub fn stride(&self) -> u32 {
        self.width * PixelFormat::Bgra8.bytes_per_pixel() as u32
    }

    fn render(&self, phase: u64) -> Bytes {
        let stride = self.stride() as usize;
        let offset = (phase * BAR_STEP as u64 % self.width as u64) as u32;

        let mut row = vec![0u8; stride];
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let bar = ((x as u32 + offset) / BAR_WIDTH) % 8;
            // BGRA
            px[0] = if bar & 1 != 0 { 0xFF } else { 0x20 };
            px[1] = if bar & 2 != 0 { 0xFF } else { 0x20 };
            px[2] = if bar & 4 != 0 { 0xFF } else { 0x20 };
            px[3] = 0xFF;
        }

        let mut pixels = BytesMut::with_capacity(stride * self.height as usize);
        for _ in 0..self.height {
            pixels.extend_from_slice(&row);
        }
        pixels.freeze()
    }
}

impl FrameSource for TestPatternSource {
    fn acquire(&mut self, _timeout: Duration) -> Result<CapturedFrame, StreamError> {
        if self.released {
            return Err(StreamError::InvalidState {
                state: "released",
                action: "acquire",
            });
        }
        if self.lost {
            return Err(StreamError::ResourceLost("test pattern device lost".into()));
        }
        let index = self.acquired;
        if self.lose_device_at == Some(index) {
            self.lose_device_at = None;
            self.lost = true;
            return Err(StreamError::ResourceLost("test pattern device lost".into()));
        }
        self.acquired += 1;

        let phase = index / self.motion_interval;
        let changed = index == 0 || index % self.motion_interval == 0;
        Ok(CapturedFrame {
            width: self.width,
            height: self.height,
            stride: self.stride(),
            format: PixelFormat::Bgra8,
            pixels: self.render(phase),
            changed,
            captured_at: Instant::now(),
        })
    }

    fn reinitialize(&mut self) -> Result<(), StreamError> {
        if self.fail_reinitialize {
            return Err(StreamError::init("frame source", "device did not come back"));
        }
        debug!("test pattern source re-initialised");
        self.lost = false;
        self.released = false;
        Ok(())
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_dimensions() {
        assert!(matches!(
            TestPatternSource::new(0, 10),
            Err(StreamError::InitializationFailure { .. })
        ));
    }

    #[test]
    fn frame_has_expected_layout() {
        let mut source = TestPatternSource::new(320, 240).unwrap();
        let frame = source.acquire(Duration::ZERO).unwrap();
        assert_eq!(frame.stride, 1280);
        assert_eq!(frame.pixels.len(), frame.byte_len());
        assert!(frame.changed);
    }

    #[test]
    fn pattern_moves_between_frames() {
        let mut source = TestPatternSource::new(256, 2).unwrap();
        let a = source.acquire(Duration::ZERO).unwrap();
        let b = source.acquire(Duration::ZERO).unwrap();
        assert_ne!(a.pixels, b.pixels);
    }

    #[test]
    fn motion_interval_marks_unchanged_frames() {
        let mut source = TestPatternSource::new(64, 2).unwrap().with_motion_interval(3);
        let changed: Vec<bool> = (0..6)
            .map(|_| source.acquire(Duration::ZERO).unwrap().changed)
            .collect();
        assert_eq!(changed, [true, false, false, true, false, false]);
    }

    #[test]
    fn device_loss_until_reinitialized() {
        let mut source = TestPatternSource::new(64, 2).unwrap().with_device_loss_at(1);
        assert!(source.acquire(Duration::ZERO).is_ok());
        assert!(matches!(
            source.acquire(Duration::ZERO),
            Err(StreamError::ResourceLost(_))
        ));
        assert!(source.acquire(Duration::ZERO).is_err());
        source.reinitialize().unwrap();
        assert!(source.acquire(Duration::ZERO).is_ok());
    }

    #[test]
    fn released_source_refuses_acquire() {
        let mut source = TestPatternSource::new(64, 2).unwrap();
        source.release();
        assert!(matches!(
            source.acquire(Duration::ZERO),
            Err(StreamError::InvalidState { .. })
        ));
    }
}
