use bitflags::bitflags;

bitflags! {
    /// Per-datagram flags carried in byte 32 of the frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Payload decodes without any earlier frame.
        const KEYFRAME = 0x01;
        /// Payload is codec output rather than raw pixel rows.
        const ENCODED = 0x02;
        /// Datagram carries a receiver report, not a frame.
        const FEEDBACK = 0x04;
        /// Datagram carries a client input event, not a frame.
        const INPUT = 0x08;
    }
}

impl FrameFlags {
    /// Whether the payload is raw pixels bounded by `stride * height`.
    pub fn is_raw_frame(self) -> bool {
        !self.intersects(FrameFlags::ENCODED | FrameFlags::FEEDBACK | FrameFlags::INPUT)
    }
}
