//! # deskstream-core
//!
//! Low-latency screen streaming over UDP.
//!
//! This crate contains:
//! - **Wire protocol**: `FrameHeader`, `Frame`, `FrameFlags`, `ReceiverReport`, input events
//! - **Codec**: `FrameCodec`, one frame per datagram, with `tokio_util` codec traits
//! - **Network**: `Transport` trait and its `UdpTransport`
//! - **Queue**: `BoundedFrameQueue` with reject-newest backpressure
//! - **Pipeline**: capture/render contracts, worker threads, bitrate control
//! - **Signaling**: session ids and offer/answer exchange between peers
//! - **Session**: `SessionOrchestrator` driving loopback, server and client modes
//! - **Error**: `StreamError`, typed, `thiserror`-based

pub mod codec;
pub mod error;
pub mod flags;
pub mod header;
pub mod network;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod signaling;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_MAX_FRAME_BYTES, FrameCodec};
pub use error::StreamError;
pub use flags::FrameFlags;
pub use header::{FrameHeader, HEADER_SIZE, MAGIC, VERSION};
pub use network::{ConnectionStats, SendOutcome, Transport, TransportOptions, TransportRole, UdpTransport};
pub use packet::{Frame, ReceiverReport, SequenceCounter, SequenceEvent, SequenceTracker};
pub use queue::{BoundedFrameQueue, DEFAULT_QUEUE_CAPACITY, QueueEntry};
pub use session::{
    CodecKind, CollaboratorFactory, InputHandle, SessionConfig, SessionOrchestrator, SessionState,
    SessionStats, StopHandle, SyntheticCollaborators,
};
pub use signaling::{
    ChannelSignaling, DirectSignaling, PeerAddresses, SessionId, SignalMessage, Signaling,
    UnavailableSignaling,
};

// ── Pipeline re-exports ──────────────────────────────────────────
pub use pipeline::{
    AdaptationMode, AdaptiveBitrateController, Codec, FrameSource, HeadlessSink, InputEvent,
    InputInjector, MouseButton, RecordingInjector, RenderSink, TestPatternSource, ZstdCodec,
};
