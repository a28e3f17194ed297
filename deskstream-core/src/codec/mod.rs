//! Datagram framing for [`Frame`]s.
//!
//! One buffer is one datagram: the header is followed directly by the
//! payload, with no escaping and no length prefix beyond `payload_size`.

use bytes::{Bytes, BytesMut};

use crate::error::StreamError;
use crate::header::{FrameHeader, HEADER_SIZE};
use crate::packet::Frame;
use crate::pipeline::PixelFormat;

/// Largest UDP payload over IPv4.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest raw image a header may describe: 7680 × 4320 BGRA.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 7680 * 4 * 4320;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_datagram_size: usize,
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATAGRAM_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            max_datagram_size: max_datagram_size.max(HEADER_SIZE),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Refuse headers describing an image larger than `bytes`.
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Largest payload that still fits in one datagram.
    pub fn max_payload_size(&self) -> usize {
        self.max_datagram_size - HEADER_SIZE
    }

    /// Serialize header and payload into one datagram.
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, StreamError> {
        let mut dst = BytesMut::with_capacity(frame.wire_len());
        self.write_frame(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Parse one datagram. Every structural check happens here; nothing
    /// that fails is ever handed to a later stage.
    pub fn decode_frame(&self, datagram: &[u8]) -> Result<Frame, StreamError> {
        self.read_frame(Bytes::copy_from_slice(datagram))
    }

    fn read_frame(&self, datagram: Bytes) -> Result<Frame, StreamError> {
        let header = FrameHeader::from_bytes(&datagram)?;
        let payload_len = datagram.len() - HEADER_SIZE;
        if header.payload_size as usize != payload_len {
            return Err(StreamError::MalformedPacket(
                "payload size does not match datagram length",
            ));
        }
        let row = header.width as u64 * PixelFormat::Bgra8.bytes_per_pixel() as u64;
        if (header.stride as u64) < row {
            return Err(StreamError::MalformedPacket("stride shorter than a pixel row"));
        }
        if header.raw_capacity() > self.max_frame_bytes as u64 {
            return Err(StreamError::MalformedPacket(
                "stride * height exceeds the frame size limit",
            ));
        }
        if header.flags.is_raw_frame() && header.payload_size as u64 > header.raw_capacity() {
            return Err(StreamError::MalformedPacket(
                "raw payload exceeds stride * height",
            ));
        }
        Frame::from_parts(header, datagram.slice(HEADER_SIZE..))
    }

    fn write_frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), StreamError> {
        let size = frame.wire_len();
        if size > self.max_datagram_size {
            return Err(StreamError::PacketTooLarge {
                size,
                max: self.max_datagram_size,
            });
        }
        dst.reserve(size);
        dst.extend_from_slice(&frame.header().to_bytes());
        dst.extend_from_slice(frame.payload());
        Ok(())
    }
}

impl tokio_util::codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // The whole buffer is consumed whether or not it parses.
        let datagram = src.split().freeze();
        self.read_frame(datagram).map(Some)
    }
}

impl tokio_util::codec::Encoder<&Frame> for FrameCodec {
    type Error = StreamError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.write_frame(item, dst)
    }
}
