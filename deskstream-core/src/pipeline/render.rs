//! Presentation contract and a headless sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::StreamError;

pub trait RenderSink: Send {
    /// Show `height` rows of `stride` bytes of BGRA pixels.
    fn present(&mut self, pixels: &[u8], width: u32, height: u32, stride: u32)
    -> Result<(), StreamError>;

    /// Pump window events. `false` once the user closed the window.
    fn poll_events(&mut self) -> bool;

    fn reinitialize(&mut self) -> Result<(), StreamError>;

    fn release(&mut self);
}

// ── HeadlessSink ─────────────────────────────────────────────────

/// What a [`HeadlessSink`] has presented, readable from any thread.
#[derive(Debug, Default)]
pub struct SinkCounters {
    frames_presented: AtomicU64,
    bytes_presented: AtomicU64,
    last_frame: Mutex<Option<(u32, u32, u32)>>,
}

impl SinkCounters {
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented.load(Ordering::Relaxed)
    }

    pub fn bytes_presented(&self) -> u64 {
        self.bytes_presented.load(Ordering::Relaxed)
    }

    /// `(width, height, stride)` of the newest frame.
    pub fn last_frame(&self) -> Option<(u32, u32, u32)> {
        *self.last_frame.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts frames without drawing them.
#[derive(Debug)]
pub struct HeadlessSink {
    counters: Arc<SinkCounters>,
    close_after: Option<u64>,
    released: bool,
}

impl HeadlessSink {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(SinkCounters::default()))
    }

    /// Report into shared counters, e.g. ones held by a test.
    pub fn with_counters(counters: Arc<SinkCounters>) -> Self {
        Self {
            counters,
            close_after: None,
            released: false,
        }
    }

    /// Behave as if the window was closed once `frames` were presented.
    pub fn close_after(mut self, frames: u64) -> Self {
        self.close_after = Some(frames);
        self
    }

    pub fn counters(&self) -> Arc<SinkCounters> {
        Arc::clone(&self.counters)
    }
}

impl Default for HeadlessSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for HeadlessSink {
    fn present(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<(), StreamError> {
        if self.released {
            return Err(StreamError::InvalidState {
                state: "released",
                action: "present",
            });
        }
        let expected = stride as u64 * height as u64;
        if width == 0 || height == 0 || (stride as u64) < width as u64 * 4 {
            return Err(StreamError::Other(format!(
                "cannot present {width}x{height} with stride {stride}"
            )));
        }
        if (pixels.len() as u64) < expected {
            return Err(StreamError::Other(format!(
                "frame too short: {} < {expected}",
                pixels.len()
            )));
        }

        self.counters.frames_presented.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_presented
            .fetch_add(pixels.len() as u64, Ordering::Relaxed);
        *self
            .counters
            .last_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((width, height, stride));
        Ok(())
    }

    fn poll_events(&mut self) -> bool {
        match self.close_after {
            Some(limit) => self.counters.frames_presented() < limit,
            None => true,
        }
    }

    fn reinitialize(&mut self) -> Result<(), StreamError> {
        self.released = false;
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            debug!(
                frames = self.counters.frames_presented(),
                "headless sink released"
            );
        }
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_records_dimensions() {
        let mut sink = HeadlessSink::new();
        let counters = sink.counters();
        sink.present(&[0u8; 64], 4, 4, 16).unwrap();
        assert_eq!(counters.frames_presented(), 1);
        assert_eq!(counters.bytes_presented(), 64);
        assert_eq!(counters.last_frame(), Some((4, 4, 16)));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut sink = HeadlessSink::new();
        assert!(sink.present(&[0u8; 63], 4, 4, 16).is_err());
        assert!(sink.present(&[0u8; 64], 5, 4, 16).is_err());
        assert_eq!(sink.counters().frames_presented(), 0);
    }

    #[test]
    fn closes_after_limit() {
        let mut sink = HeadlessSink::new().close_after(2);
        assert!(sink.poll_events());
        sink.present(&[0u8; 16], 2, 2, 8).unwrap();
        assert!(sink.poll_events());
        sink.present(&[0u8; 16], 2, 2, 8).unwrap();
        assert!(!sink.poll_events());
    }

    #[test]
    fn released_sink_refuses_frames() {
        let mut sink = HeadlessSink::new();
        sink.release();
        assert!(sink.present(&[0u8; 16], 2, 2, 8).is_err());
        sink.reinitialize().unwrap();
        assert!(sink.present(&[0u8; 16], 2, 2, 8).is_ok());
    }
}
