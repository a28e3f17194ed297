//! Frames, sequence bookkeeping and receiver reports.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::StreamError;
use crate::flags::FrameFlags;
use crate::header::FrameHeader;
use crate::pipeline::InputEvent;

// ── Frame ────────────────────────────────────────────────────────

/// A header plus the payload bytes that follow it on the wire.
///
/// The payload is either raw pixel rows or codec output; `width`,
/// `height` and `stride` always describe the raw image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// A raw BGRA frame. Raw frames are always self-contained.
    pub fn raw(sequence: u16, width: u32, height: u32, stride: u32, pixels: Bytes) -> Self {
        let mut header = FrameHeader::new(sequence, width, height, stride, pixels.len() as u32);
        header.flags = FrameFlags::KEYFRAME;
        Self {
            header,
            payload: pixels,
        }
    }

    /// A frame whose payload was produced by a codec.
    pub fn encoded(
        sequence: u16,
        width: u32,
        height: u32,
        stride: u32,
        data: Bytes,
        keyframe: bool,
    ) -> Self {
        let mut header = FrameHeader::new(sequence, width, height, stride, data.len() as u32);
        header.flags = FrameFlags::ENCODED;
        header.flags.set(FrameFlags::KEYFRAME, keyframe);
        Self {
            header,
            payload: data,
        }
    }

    /// A receiver-report datagram.
    pub fn feedback(sequence: u16, report: &ReceiverReport) -> Self {
        let payload = report.to_bytes();
        let mut header = FrameHeader::new(sequence, 0, 0, 0, payload.len() as u32);
        header.flags = FrameFlags::FEEDBACK;
        Self { header, payload }
    }

    /// A client input event for the server to replay.
    pub fn input(sequence: u16, event: &InputEvent) -> Result<Self, StreamError> {
        let payload = Bytes::from(event.to_bytes()?);
        let mut header = FrameHeader::new(sequence, 0, 0, 0, payload.len() as u32);
        header.flags = FrameFlags::INPUT;
        Ok(Self { header, payload })
    }

    /// Reassemble a frame, checking that the header describes the payload.
    pub fn from_parts(header: FrameHeader, payload: Bytes) -> Result<Self, StreamError> {
        if header.payload_size as usize != payload.len() {
            return Err(StreamError::MalformedPacket(
                "payload size does not match datagram length",
            ));
        }
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_parts(self) -> (FrameHeader, Bytes) {
        (self.header, self.payload)
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    pub fn flags(&self) -> FrameFlags {
        self.header.flags
    }

    pub fn is_feedback(&self) -> bool {
        self.header.flags.contains(FrameFlags::FEEDBACK)
    }

    pub fn is_input(&self) -> bool {
        self.header.flags.contains(FrameFlags::INPUT)
    }

    /// Override the capture timestamp (ms since UNIX epoch).
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    /// Header plus payload length.
    pub fn wire_len(&self) -> usize {
        crate::header::HEADER_SIZE + self.payload.len()
    }
}

// ── Sequence numbers ─────────────────────────────────────────────

/// Monotonic `u16` sequence generator that wraps at 65536.
#[derive(Debug, Default, Clone)]
pub struct SequenceCounter {
    next: u16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next: u16) -> Self {
        Self { next }
    }

    /// Return the current value and advance.
    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn peek(&self) -> u16 {
        self.next
    }
}

/// What a newly observed sequence number means for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    /// First frame, or exactly the expected one.
    InOrder,
    /// `n` frames were skipped before this one.
    Gap(u16),
    /// A frame counted as lost arrived after all.
    Late,
    /// Already received, or too old to tell.
    Duplicate,
}

/// How many sequence numbers behind the newest one a late arrival can
/// still be matched against its gap.
const MISSING_WINDOW: u16 = 64;

/// Receiver-side gap detection over wrapping sequence numbers.
///
/// Sequence numbers exist to detect loss; nothing is reordered.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    expected: Option<u16>,
    highest: u16,
    /// Bit `i` set: `highest - 1 - i` is still missing.
    missing: u64,
    total_received: u64,
    total_lost: u64,
    total_late: u64,
    total_duplicates: u64,
    window_received: u32,
    window_lost: u32,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sequence: u16) -> SequenceEvent {
        let Some(expected) = self.expected else {
            self.count_received();
            self.expected = Some(sequence.wrapping_add(1));
            self.highest = sequence;
            return SequenceEvent::InOrder;
        };

        let distance = sequence.wrapping_sub(expected) as i16;
        if distance < 0 {
            return self.observe_old(sequence);
        }

        self.count_received();
        let gap = distance as u16;
        let shift = u32::from(gap) + 1;
        self.missing = self.missing.checked_shl(shift).unwrap_or(0);
        let marked = gap.min(MISSING_WINDOW);
        if marked > 0 {
            self.missing |= u64::MAX >> (64 - u32::from(marked));
        }
        self.expected = Some(sequence.wrapping_add(1));
        self.highest = sequence;
        if gap == 0 {
            SequenceEvent::InOrder
        } else {
            self.total_lost += gap as u64;
            self.window_lost = self.window_lost.saturating_add(gap as u32);
            SequenceEvent::Gap(gap)
        }
    }

    /// A sequence at or behind the newest one.
    fn observe_old(&mut self, sequence: u16) -> SequenceEvent {
        let behind = self.highest.wrapping_sub(sequence);
        let bit = match behind.checked_sub(1) {
            Some(index) if index < MISSING_WINDOW => 1u64 << index,
            _ => 0,
        };
        if self.missing & bit == 0 {
            self.total_duplicates += 1;
            return SequenceEvent::Duplicate;
        }
        self.missing &= !bit;
        self.count_received();
        self.total_late += 1;
        self.total_lost = self.total_lost.saturating_sub(1);
        self.window_lost = self.window_lost.saturating_sub(1);
        SequenceEvent::Late
    }

    fn count_received(&mut self) {
        self.total_received += 1;
        self.window_received = self.window_received.saturating_add(1);
    }

    /// Newest sequence number accepted in order.
    pub fn highest(&self) -> u16 {
        self.highest
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn total_lost(&self) -> u64 {
        self.total_lost
    }

    pub fn total_late(&self) -> u64 {
        self.total_late
    }

    pub fn total_duplicates(&self) -> u64 {
        self.total_duplicates
    }

    /// Counts since the previous call, then start a new window.
    pub fn take_window(&mut self) -> (u32, u32) {
        let counts = (self.window_received, self.window_lost);
        self.window_received = 0;
        self.window_lost = 0;
        counts
    }
}

// ── ReceiverReport ───────────────────────────────────────────────

/// Reception quality a client reports back to the server.
///
/// Wire layout (24 bytes, little-endian):
/// ```text
/// echo_timestamp    u64  header timestamp of the newest frame received,
///                        plus the time the client held it before reporting
/// frames_received   u32  frames received in this report window
/// frames_lost       u32  sequence gaps in this report window
/// highest_sequence  u16
/// reserved          u16
/// buffer_ms         u32  render-queue depth expressed in milliseconds
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverReport {
    pub echo_timestamp: u64,
    pub frames_received: u32,
    pub frames_lost: u32,
    pub highest_sequence: u16,
    pub buffer_ms: u32,
}

impl ReceiverReport {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.echo_timestamp);
        buf.put_u32_le(self.frames_received);
        buf.put_u32_le(self.frames_lost);
        buf.put_u16_le(self.highest_sequence);
        buf.put_u16_le(0);
        buf.put_u32_le(self.buffer_ms);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StreamError> {
        if data.len() != Self::SIZE {
            return Err(StreamError::MalformedPacket("receiver report has wrong length"));
        }
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[0..8]);
        Ok(Self {
            echo_timestamp: u64::from_le_bytes(ts),
            frames_received: u32_at(8),
            frames_lost: u32_at(12),
            highest_sequence: u16::from_le_bytes([data[16], data[17]]),
            buffer_ms: u32_at(20),
        })
    }

    /// Lost share of the frames expected in this window, in percent.
    pub fn loss_percent(&self) -> f64 {
        let expected = self.frames_received as u64 + self.frames_lost as u64;
        if expected == 0 {
            return 0.0;
        }
        self.frames_lost as f64 * 100.0 / expected as f64
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_wraps_after_65536_increments() {
        let mut counter = SequenceCounter::starting_at(1234);
        for _ in 0..65536u32 {
            counter.next();
        }
        assert_eq!(counter.peek(), 1234);
    }

    #[test]
    fn raw_frame_sets_payload_size_and_keyframe() {
        let frame = Frame::raw(7, 4, 2, 16, Bytes::from(vec![0u8; 32]));
        assert_eq!(frame.header().payload_size, 32);
        assert!(frame.flags().contains(FrameFlags::KEYFRAME));
        assert!(frame.flags().is_raw_frame());
        assert_eq!(frame.wire_len(), 48 + 32);
    }

    #[test]
    fn from_parts_rejects_length_mismatch() {
        let frame = Frame::raw(0, 4, 2, 16, Bytes::from(vec![1u8; 32]));
        let (header, _) = frame.into_parts();
        assert!(Frame::from_parts(header, Bytes::from(vec![1u8; 31])).is_err());
    }

    #[test]
    fn tracker_counts_gaps_across_wrap() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(65534), SequenceEvent::InOrder);
        assert_eq!(tracker.observe(65535), SequenceEvent::InOrder);
        assert_eq!(tracker.observe(2), SequenceEvent::Gap(2));
        assert_eq!(tracker.total_lost(), 2);
        assert_eq!(tracker.highest(), 2);
    }

    #[test]
    fn tracker_late_frame_reduces_loss() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(10);
        tracker.observe(13);
        assert_eq!(tracker.observe(11), SequenceEvent::Late);
        assert_eq!(tracker.total_lost(), 1);
        assert_eq!(tracker.total_late(), 1);
        assert_eq!(tracker.take_window(), (3, 1));
        assert_eq!(tracker.take_window(), (0, 0));

        // Once recovered it is a duplicate like any other.
        assert_eq!(tracker.observe(11), SequenceEvent::Duplicate);
        assert_eq!(tracker.total_lost(), 1);
    }

    #[test]
    fn duplicate_of_newest_keeps_loss() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(10);
        assert_eq!(tracker.observe(13), SequenceEvent::Gap(2));
        assert_eq!(tracker.observe(13), SequenceEvent::Duplicate);
        assert_eq!(tracker.total_lost(), 2);
        assert_eq!(tracker.total_duplicates(), 1);
        assert_eq!(tracker.take_window(), (2, 2));
    }

    #[test]
    fn duplicate_of_older_received_frame_keeps_loss() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(10);
        tracker.observe(11);
        tracker.observe(14);
        assert_eq!(tracker.observe(11), SequenceEvent::Duplicate);
        assert_eq!(tracker.observe(10), SequenceEvent::Duplicate);
        assert_eq!(tracker.total_lost(), 2);
        assert_eq!(tracker.observe(12), SequenceEvent::Late);
        assert_eq!(tracker.observe(12), SequenceEvent::Duplicate);
        assert_eq!(tracker.total_lost(), 1);
        assert_eq!(tracker.take_window(), (4, 1));
    }

    #[test]
    fn missing_frames_are_remembered_across_wrap() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(65533);
        assert_eq!(tracker.observe(1), SequenceEvent::Gap(3));
        assert_eq!(tracker.observe(65535), SequenceEvent::Late);
        assert_eq!(tracker.observe(0), SequenceEvent::Late);
        assert_eq!(tracker.observe(65534), SequenceEvent::Late);
        assert_eq!(tracker.total_lost(), 0);
        assert_eq!(tracker.observe(65533), SequenceEvent::Duplicate);
    }

    #[test]
    fn input_frame_carries_event() {
        let event = InputEvent::MouseMove { x: 12, y: -3 };
        let frame = Frame::input(5, &event).unwrap();
        assert!(frame.is_input());
        assert!(!frame.is_feedback());
        assert!(!frame.flags().is_raw_frame());
        assert_eq!(InputEvent::from_bytes(frame.payload()).unwrap(), event);
    }

    #[test]
    fn report_roundtrip_and_loss() {
        let report = ReceiverReport {
            echo_timestamp: 1_700_000_000_000,
            frames_received: 96,
            frames_lost: 4,
            highest_sequence: 400,
            buffer_ms: 33,
        };
        let bytes = report.to_bytes();
        assert_eq!(bytes.len(), ReceiverReport::SIZE);
        assert_eq!(ReceiverReport::from_bytes(&bytes).unwrap(), report);
        assert!((report.loss_percent() - 4.0).abs() < 1e-9);
        assert_eq!(ReceiverReport::default().loss_percent(), 0.0);
    }
}
