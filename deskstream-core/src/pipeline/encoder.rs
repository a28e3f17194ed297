//! Frame codecs.
//!
//! Hardware encoders sit behind [`Codec`]. [`ZstdCodec`] compresses whole
//! frames and picks its compression level from the target bitrate the
//! bitrate controller hands it; [`RawCodec`] passes pixels through.

use bytes::Bytes;
use tracing::debug;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::error::StreamError;
use crate::header::FrameHeader;
use crate::pipeline::types::{CapturedFrame, EncodedPayload};

pub trait Codec: Send {
    fn encode(&mut self, frame: &CapturedFrame) -> Result<EncodedPayload, StreamError>;

    /// Reconstruct `stride * height` bytes of pixels described by `header`.
    fn decode(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, StreamError>;

    /// Drain frames the codec is still holding.
    fn flush(&mut self) -> Result<Vec<EncodedPayload>, StreamError>;

    fn set_target_bitrate(&mut self, mbps: u32);

    fn name(&self) -> &'static str;
}

// ── ZstdCodec ────────────────────────────────────────────────────

/// Whole-frame zstd compression. Every frame is self-contained.
pub struct ZstdCodec {
    level: i32,
    target_mbps: u32,
    frames_encoded: u64,
    max_frame_bytes: usize,
}

impl ZstdCodec {
    pub fn new(target_mbps: u32) -> Self {
        Self {
            level: level_for_bitrate(target_mbps),
            target_mbps,
            frames_encoded: 0,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Refuse to decode frames that would expand beyond `bytes`.
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn target_mbps(&self) -> u32 {
        self.target_mbps
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

/// More bandwidth buys a faster, lighter level.
fn level_for_bitrate(mbps: u32) -> i32 {
    match mbps {
        50.. => 1,
        25..=49 => 3,
        10..=24 => 6,
        _ => 9,
    }
}

impl Codec for ZstdCodec {
    fn encode(&mut self, frame: &CapturedFrame) -> Result<EncodedPayload, StreamError> {
        let compressed = zstd::bulk::compress(&frame.pixels, self.level)
            .map_err(|e| StreamError::Codec(format!("zstd encode failed: {e}")))?;
        self.frames_encoded += 1;
        Ok(EncodedPayload {
            data: Bytes::from(compressed),
            keyframe: true,
            compressed: true,
        })
    }

    /// The frame must declare its content size, and that size must be
    /// exactly the `stride * height` the header describes. Nothing is
    /// allocated before both checks pass.
    fn decode(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, StreamError> {
        let declared = match zstd::zstd_safe::get_frame_content_size(payload) {
            Ok(Some(size)) => size,
            Ok(None) => return Err(StreamError::Codec("zstd frame without a content size".into())),
            Err(_) => return Err(StreamError::Codec("payload is not a zstd frame".into())),
        };
        if declared > self.max_frame_bytes as u64 {
            return Err(StreamError::Codec(format!(
                "zstd frame declares {declared} bytes, limit is {}",
                self.max_frame_bytes
            )));
        }
        if declared != header.raw_capacity() {
            return Err(StreamError::Codec(format!(
                "zstd frame declares {declared} bytes, header describes {}",
                header.raw_capacity()
            )));
        }
        let pixels = zstd::bulk::decompress(payload, declared as usize)
            .map_err(|e| StreamError::Codec(format!("zstd decode failed: {e}")))?;
        Ok(pixels)
    }

    fn flush(&mut self) -> Result<Vec<EncodedPayload>, StreamError> {
        Ok(Vec::new())
    }

    fn set_target_bitrate(&mut self, mbps: u32) {
        let level = level_for_bitrate(mbps);
        if level != self.level {
            debug!(mbps, from = self.level, to = level, "zstd level changed");
        }
        self.target_mbps = mbps;
        self.level = level;
    }

    fn name(&self) -> &'static str {
        "zstd"
    }
}

// ── RawCodec ─────────────────────────────────────────────────────

/// Pass-through. Frames go out as raw pixel rows.
#[derive(Debug, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn encode(&mut self, frame: &CapturedFrame) -> Result<EncodedPayload, StreamError> {
        Ok(EncodedPayload {
            data: frame.pixels.clone(),
            keyframe: true,
            compressed: false,
        })
    }

    fn decode(&mut self, _header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, StreamError> {
        Ok(payload.to_vec())
    }

    fn flush(&mut self) -> Result<Vec<EncodedPayload>, StreamError> {
        Ok(Vec::new())
    }

    fn set_target_bitrate(&mut self, _mbps: u32) {}

    fn name(&self) -> &'static str {
        "raw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::capture::{FrameSource, TestPatternSource};
    use std::time::Duration;

    fn pattern(width: u32, height: u32) -> CapturedFrame {
        TestPatternSource::new(width, height)
            .unwrap()
            .acquire(Duration::ZERO)
            .unwrap()
    }

    #[test]
    fn zstd_roundtrip_restores_pixels() {
        let frame = pattern(320, 240);
        let mut codec = ZstdCodec::new(50);
        let encoded = codec.encode(&frame).unwrap();
        assert!(encoded.compressed && encoded.keyframe);
        assert!(encoded.data.len() < frame.pixels.len());

        let header = FrameHeader::new(0, 320, 240, 1280, encoded.data.len() as u32);
        let decoded = codec.decode(&header, &encoded.data).unwrap();
        assert_eq!(decoded, frame.pixels.to_vec());
        assert_eq!(codec.frames_encoded(), 1);
    }

    #[test]
    fn full_hd_pattern_fits_in_one_datagram() {
        let frame = pattern(1920, 1080);
        let encoded = ZstdCodec::new(50).encode(&frame).unwrap();
        assert!(encoded.data.len() < crate::codec::DEFAULT_MAX_DATAGRAM_SIZE - 48);
    }

    #[test]
    fn decode_refuses_more_than_the_header_describes() {
        let frame = pattern(64, 64);
        let mut codec = ZstdCodec::new(50);
        let encoded = codec.encode(&frame).unwrap();
        let header = FrameHeader::new(0, 64, 32, 256, encoded.data.len() as u32);
        assert!(matches!(
            codec.decode(&header, &encoded.data),
            Err(StreamError::Codec(_))
        ));
    }

    #[test]
    fn decode_checks_declared_size_before_allocating() {
        let mut codec = ZstdCodec::new(50);
        let small = zstd::bulk::compress(&[0u8; 16], 3).unwrap();
        let huge = FrameHeader::new(0, 65_535, 65_535, 0x7FFF_FFFF, small.len() as u32);
        assert!(matches!(
            codec.decode(&huge, &small),
            Err(StreamError::Codec(_))
        ));

        let frame = pattern(64, 16);
        let encoded = codec.encode(&frame).unwrap();
        let header = FrameHeader::new(0, 64, 16, 256, encoded.data.len() as u32);
        let mut strict = ZstdCodec::new(50).with_max_frame_bytes(1024);
        let err = strict.decode(&header, &encoded.data).unwrap_err();
        assert!(err.to_string().contains("limit"));
        assert_eq!(codec.decode(&header, &encoded.data).unwrap().len(), 4096);
    }

    #[test]
    fn decode_rejects_non_zstd_payload() {
        let header = FrameHeader::new(0, 2, 2, 8, 5);
        assert!(matches!(
            ZstdCodec::new(20).decode(&header, b"hello"),
            Err(StreamError::Codec(_))
        ));
    }

    #[test]
    fn level_follows_bitrate() {
        let mut codec = ZstdCodec::new(100);
        assert_eq!(codec.level(), 1);
        codec.set_target_bitrate(30);
        assert_eq!(codec.level(), 3);
        codec.set_target_bitrate(10);
        assert_eq!(codec.level(), 6);
        codec.set_target_bitrate(5);
        assert_eq!(codec.level(), 9);
        assert_eq!(codec.target_mbps(), 5);
    }

    #[test]
    fn flush_is_empty_for_intra_only_codecs() {
        assert!(ZstdCodec::new(10).flush().unwrap().is_empty());
        assert!(RawCodec.flush().unwrap().is_empty());
    }

    #[test]
    fn raw_codec_passes_through() {
        let frame = pattern(16, 4);
        let encoded = RawCodec.encode(&frame).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.data, frame.pixels);
    }
}
