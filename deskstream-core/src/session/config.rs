//! Runtime knobs for a session. Built directly or from the binary's TOML.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::network::TransportOptions;
use crate::pipeline::worker::DEFAULT_TARGET_FPS;
use crate::pipeline::AdaptationMode;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Which codec the server encodes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Zstd,
    Raw,
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zstd => write!(f, "zstd"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Everything a [`SessionOrchestrator`](super::SessionOrchestrator) needs
/// besides its collaborators.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capture cadence, frames per second.
    pub target_fps: u32,
    /// Capacity of both the capture and the render queue.
    pub queue_capacity: usize,
    /// Run capture and render on worker threads. When `false`, or when a
    /// worker fails to start, the stage runs inline on the session thread.
    pub threaded: bool,
    /// Frame size a server or host asks its frame source for.
    pub capture_width: u32,
    pub capture_height: u32,
    pub codec: CodecKind,
    pub min_bitrate_mbps: u32,
    pub max_bitrate_mbps: u32,
    pub adaptation_mode: AdaptationMode,
    pub transport: TransportOptions,
    /// How long a client blocks in one receive.
    pub receive_timeout: Duration,
    /// Receiver-report cadence on the client.
    pub feedback_interval: Duration,
    /// Periodic `log_stats` cadence; zero disables it.
    pub stats_interval: Duration,
    pub input_enabled: bool,
    /// How long a guest waits for the host's answer.
    pub signaling_timeout: Duration,
    /// Address a host puts into its session id. Detected when `None`.
    pub advertise_address: Option<Ipv4Addr>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            threaded: true,
            capture_width: 1920,
            capture_height: 1080,
            codec: CodecKind::Zstd,
            min_bitrate_mbps: 5,
            max_bitrate_mbps: 100,
            adaptation_mode: AdaptationMode::Balanced,
            transport: TransportOptions::default(),
            receive_timeout: Duration::from_millis(5),
            feedback_interval: Duration::from_millis(250),
            stats_interval: Duration::from_secs(5),
            input_enabled: true,
            signaling_timeout: Duration::from_secs(10),
            advertise_address: None,
        }
    }
}

impl SessionConfig {
    /// Time between two capture ticks.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(1) as f64)
    }

    /// Reject values no session can run with.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.target_fps == 0 {
            return Err(StreamError::InvalidConfig("target_fps must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StreamError::InvalidConfig("queue_capacity must be positive".into()));
        }
        if self.min_bitrate_mbps == 0 || self.min_bitrate_mbps > self.max_bitrate_mbps {
            return Err(StreamError::InvalidConfig(format!(
                "bitrate range {}..={} is empty",
                self.min_bitrate_mbps, self.max_bitrate_mbps
            )));
        }
        let frame_bytes = self.capture_width as u64 * 4 * self.capture_height as u64;
        if frame_bytes > self.transport.max_frame_bytes as u64 {
            return Err(StreamError::InvalidConfig(format!(
                "{}x{} capture exceeds the {} byte frame limit",
                self.capture_width, self.capture_height, self.transport.max_frame_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SessionConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.queue_capacity, 10);
        assert_eq!(cfg.feedback_interval, Duration::from_millis(250));
        assert!((cfg.frame_interval().as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn inverted_bitrate_range_is_rejected() {
        let cfg = SessionConfig {
            min_bitrate_mbps: 50,
            max_bitrate_mbps: 10,
            ..SessionConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(StreamError::InvalidConfig(_))));
    }

    #[test]
    fn capture_larger_than_frame_limit_is_rejected() {
        let mut cfg = SessionConfig::default();
        cfg.transport.max_frame_bytes = 1920 * 4 * 1080 - 1;
        assert!(matches!(cfg.validate(), Err(StreamError::InvalidConfig(_))));
        cfg.transport.max_frame_bytes += 1;
        cfg.validate().unwrap();
    }

    #[test]
    fn codec_kind_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            codec: CodecKind,
        }
        let w: Wrapper = serde_json::from_str(r#"{"codec":"raw"}"#).unwrap();
        assert_eq!(w.codec, CodecKind::Raw);
        assert_eq!(CodecKind::Zstd.to_string(), "zstd");
    }
}
