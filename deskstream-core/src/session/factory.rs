//! Where a session gets its external collaborators from.

use std::sync::Arc;

use tracing::debug;

use crate::error::StreamError;
use crate::pipeline::{
    Codec, FrameSource, HeadlessSink, InputEvent, InputInjector, RawCodec, RecordingInjector,
    RenderSink, SinkCounters, TestPatternSource, ZstdCodec,
};
use crate::session::config::CodecKind;

/// Builds capture, codec, presentation and input collaborators on demand.
///
/// Each call returns a fresh instance the session owns until `stop`.
pub trait CollaboratorFactory: Send {
    fn frame_source(&mut self, width: u32, height: u32) -> Result<Box<dyn FrameSource>, StreamError>;

    fn render_sink(&mut self, width: u32, height: u32) -> Result<Box<dyn RenderSink>, StreamError>;

    fn codec(&mut self, kind: CodecKind, bitrate_mbps: u32) -> Result<Box<dyn Codec>, StreamError>;

    fn input_injector(&mut self) -> Result<Box<dyn InputInjector>, StreamError>;
}

// ── SyntheticCollaborators ───────────────────────────────────────

/// Test pattern in, headless sink out, zstd in between. Input injection
/// is unsupported unless [`record_input`](Self::record_input) is set.
///
/// All sinks it hands out report into one [`SinkCounters`].
#[derive(Debug, Default)]
pub struct SyntheticCollaborators {
    counters: Arc<SinkCounters>,
    close_after: Option<u64>,
    motion_interval: Option<u64>,
    source_loss_at: Option<u64>,
    failing_reinitialize: bool,
    input: Option<RecordingInjector>,
}

impl SyntheticCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks report their window closed after `frames` presents.
    pub fn close_after(mut self, frames: u64) -> Self {
        self.close_after = Some(frames);
        self
    }

    pub fn with_motion_interval(mut self, interval: u64) -> Self {
        self.motion_interval = Some(interval);
        self
    }

    /// Sources lose their device on this acquire.
    pub fn with_source_loss_at(mut self, acquire_index: u64) -> Self {
        self.source_loss_at = Some(acquire_index);
        self
    }

    /// Lost sources never come back.
    pub fn with_failing_reinitialize(mut self) -> Self {
        self.failing_reinitialize = true;
        self
    }

    /// Hand out injectors that record events instead of replaying them.
    pub fn record_input(mut self) -> Self {
        self.input = Some(RecordingInjector::new());
        self
    }

    pub fn counters(&self) -> Arc<SinkCounters> {
        Arc::clone(&self.counters)
    }

    /// Events injected so far through any injector this factory built.
    pub fn recorded_input(&self) -> Vec<InputEvent> {
        self.input.as_ref().map(RecordingInjector::events).unwrap_or_default()
    }

    /// A view on the recording that outlives the factory.
    pub fn input_recorder(&self) -> Option<RecordingInjector> {
        self.input.clone()
    }
}

impl CollaboratorFactory for SyntheticCollaborators {
    fn frame_source(&mut self, width: u32, height: u32) -> Result<Box<dyn FrameSource>, StreamError> {
        let mut source = TestPatternSource::new(width, height)?;
        if let Some(interval) = self.motion_interval {
            source = source.with_motion_interval(interval);
        }
        if let Some(at) = self.source_loss_at {
            source = source.with_device_loss_at(at);
        }
        if self.failing_reinitialize {
            source = source.with_failing_reinitialize();
        }
        Ok(Box::new(source))
    }

    fn render_sink(&mut self, width: u32, height: u32) -> Result<Box<dyn RenderSink>, StreamError> {
        debug!(width, height, "headless sink created");
        let mut sink = HeadlessSink::with_counters(Arc::clone(&self.counters));
        if let Some(frames) = self.close_after {
            sink = sink.close_after(frames);
        }
        Ok(Box::new(sink))
    }

    fn codec(&mut self, kind: CodecKind, bitrate_mbps: u32) -> Result<Box<dyn Codec>, StreamError> {
        Ok(match kind {
            CodecKind::Zstd => Box::new(ZstdCodec::new(bitrate_mbps)),
            CodecKind::Raw => Box::new(RawCodec),
        })
    }

    fn input_injector(&mut self) -> Result<Box<dyn InputInjector>, StreamError> {
        match &self.input {
            Some(recorder) => Ok(Box::new(recorder.clone())),
            None => Err(StreamError::Unsupported("input injection")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sinks_share_one_tally() {
        let mut factory = SyntheticCollaborators::new();
        let counters = factory.counters();
        let mut a = factory.render_sink(2, 2).unwrap();
        let mut b = factory.render_sink(2, 2).unwrap();
        a.present(&[0u8; 16], 2, 2, 8).unwrap();
        b.present(&[0u8; 16], 2, 2, 8).unwrap();
        assert_eq!(counters.frames_presented(), 2);
    }

    #[test]
    fn codec_kind_selects_implementation() {
        let mut factory = SyntheticCollaborators::new();
        assert_eq!(factory.codec(CodecKind::Zstd, 20).unwrap().name(), "zstd");
        assert_eq!(factory.codec(CodecKind::Raw, 20).unwrap().name(), "raw");
    }

    #[test]
    fn source_carries_configured_faults() {
        let mut factory = SyntheticCollaborators::new().with_source_loss_at(0);
        let mut source = factory.frame_source(8, 8).unwrap();
        assert!(matches!(
            source.acquire(Duration::ZERO),
            Err(StreamError::ResourceLost(_))
        ));
        assert!(factory.frame_source(0, 8).is_err());
    }

    #[test]
    fn input_injection_is_unsupported() {
        let mut factory = SyntheticCollaborators::new();
        assert!(matches!(
            factory.input_injector(),
            Err(StreamError::Unsupported(_))
        ));
        assert!(factory.recorded_input().is_empty());
    }

    #[test]
    fn recorded_input_is_visible_through_factory() {
        let mut factory = SyntheticCollaborators::new().record_input();
        let mut injector = factory.input_injector().unwrap();
        injector.inject(&InputEvent::MouseMove { x: 1, y: 2 }).unwrap();
        assert_eq!(factory.recorded_input(), vec![InputEvent::MouseMove { x: 1, y: 2 }]);
    }
}
