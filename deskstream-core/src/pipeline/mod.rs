//! # Frame pipeline
//!
//! ```text
//! SERVER                                         CLIENT
//! FrameSource                                    UdpTransport::receive_frame
//!   ↓ CaptureWorker (thread)                       ↓ Codec::decode (ENCODED only)
//! BoundedFrameQueue<SequencedFrame>              BoundedFrameQueue<RenderFrame>
//!   ↓ Codec::encode                                ↓ RenderWorker (thread)
//! UdpTransport::send_frame  ───── UDP ─────►     RenderSink
//!           ▲                                        │
//!           └──── FEEDBACK (ReceiverReport) ─────────┘
//!                  ↓
//!          AdaptiveBitrateController → Codec::set_target_bitrate
//! ```
//!
//! | Module      | Purpose                                          |
//! |-------------|--------------------------------------------------|
//! | `types`     | Frame types shared between stages                |
//! | `capture`   | `FrameSource` contract, synthetic test pattern   |
//! | `encoder`   | `Codec` contract, zstd and raw codecs            |
//! | `render`    | `RenderSink` contract, headless sink             |
//! | `input`     | Input events, `InputInjector` contract           |
//! | `bandwidth` | Throughput estimator and bitrate controller      |
//! | `worker`    | Capture / render threads                         |

pub mod bandwidth;
pub mod capture;
pub mod encoder;
pub mod input;
pub mod render;
pub mod types;
pub mod worker;

pub use bandwidth::{AbrStats, AdaptationMode, AdaptiveBitrateController, BandwidthEstimator};
pub use capture::{FrameSource, TestPatternSource};
pub use encoder::{Codec, RawCodec, ZstdCodec};
pub use input::{InputEvent, InputInjector, MouseButton, RecordingInjector};
pub use render::{HeadlessSink, RenderSink, SinkCounters};
pub use types::{CapturedFrame, EncodedPayload, PixelFormat, RenderFrame, SequencedFrame};
pub use worker::{CaptureWorker, RenderWorker, WorkerEvent, WorkerHandle, WorkerStats};
