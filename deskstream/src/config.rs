//! Configuration for the deskstream binary.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use deskstream_core::network::{DEFAULT_SOCKET_BUFFER, TransportOptions};
use deskstream_core::{
    AdaptationMode, CodecKind, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_MAX_FRAME_BYTES, HEADER_SIZE,
    SessionConfig,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Sockets, peers and signaling.
    pub network: NetworkConfig,
    /// Capture cadence, queues and codec.
    pub pipeline: PipelineConfig,
    /// Adaptive bitrate bounds.
    pub abr: AbrConfig,
    /// Local presentation.
    pub display: DisplayConfig,
    /// Input injection.
    pub input: InputConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port a server or host listens on.
    pub port: u16,
    /// Socket send buffer in KiB.
    pub send_buffer_kb: usize,
    /// Socket receive buffer in KiB.
    pub recv_buffer_kb: usize,
    /// Largest datagram, header included.
    pub max_datagram_size: usize,
    /// Largest raw frame (`stride * height`) a received header may describe.
    pub max_frame_bytes: usize,
    /// How long a client blocks per receive, in milliseconds.
    pub receive_timeout_ms: u64,
    /// Receiver-report cadence in milliseconds.
    pub feedback_interval_ms: u64,
    /// IPv4 address a host puts into its session id. Detected if empty.
    pub advertise_address: String,
    /// How long `join` waits for the host, in seconds.
    pub signaling_timeout_secs: u64,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target frames per second.
    pub fps: u32,
    /// Capacity of the capture and render queues.
    pub queue_capacity: usize,
    /// Capture and render on worker threads.
    pub threaded: bool,
    /// Frame size a server captures.
    pub capture_width: u32,
    pub capture_height: u32,
    /// "zstd" or "raw".
    pub codec: CodecKind,
}

/// Adaptive bitrate configuration, all values in Mbps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    pub initial_mbps: u32,
    pub min_mbps: u32,
    pub max_mbps: u32,
    /// "conservative", "balanced" or "aggressive".
    pub mode: AdaptationMode,
}

/// Presentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Loopback frame size and client window size.
    pub width: u32,
    pub height: u32,
    /// Close the headless window after this many frames; 0 keeps it open.
    pub close_after_frames: u64,
    /// Seconds between stats lines; 0 disables them.
    pub stats_interval_secs: u64,
}

/// Input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub enabled: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 7331,
            send_buffer_kb: DEFAULT_SOCKET_BUFFER / 1024,
            recv_buffer_kb: DEFAULT_SOCKET_BUFFER / 1024,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            receive_timeout_ms: 5,
            feedback_interval_ms: 250,
            advertise_address: String::new(),
            signaling_timeout_secs: 10,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            queue_capacity: 10,
            threaded: true,
            capture_width: 1920,
            capture_height: 1080,
            codec: CodecKind::Zstd,
        }
    }
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            initial_mbps: 20,
            min_mbps: 5,
            max_mbps: 100,
            mode: AdaptationMode::Balanced,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            close_after_frames: 0,
            stats_interval_secs: 5,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The advertised address, if one is configured and parses.
    pub fn advertise_address(&self) -> Option<Ipv4Addr> {
        let text = self.network.advertise_address.trim();
        if text.is_empty() {
            return None;
        }
        match text.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!("ignoring advertise_address `{text}`: not an IPv4 address");
                None
            }
        }
    }

    /// Convert into a `SessionConfig`, clamping values into working ranges.
    pub fn to_session_config(&self) -> SessionConfig {
        let min_bitrate = self.abr.min_mbps.max(1);
        let max_bitrate = self.abr.max_mbps.max(min_bitrate);
        SessionConfig {
            target_fps: self.pipeline.fps.clamp(1, 240),
            queue_capacity: self.pipeline.queue_capacity.clamp(1, 1024),
            threaded: self.pipeline.threaded,
            capture_width: self.pipeline.capture_width.clamp(1, 7680),
            capture_height: self.pipeline.capture_height.clamp(1, 4320),
            codec: self.pipeline.codec,
            min_bitrate_mbps: min_bitrate,
            max_bitrate_mbps: max_bitrate,
            adaptation_mode: self.abr.mode,
            transport: TransportOptions {
                send_buffer: self.network.send_buffer_kb * 1024,
                recv_buffer: self.network.recv_buffer_kb * 1024,
                max_datagram_size: self
                    .network
                    .max_datagram_size
                    .clamp(HEADER_SIZE + 1, DEFAULT_MAX_DATAGRAM_SIZE),
                max_frame_bytes: self.network.max_frame_bytes.clamp(4, DEFAULT_MAX_FRAME_BYTES),
            },
            receive_timeout: Duration::from_millis(self.network.receive_timeout_ms.clamp(1, 1000)),
            feedback_interval: Duration::from_millis(self.network.feedback_interval_ms.max(10)),
            stats_interval: Duration::from_secs(self.display.stats_interval_secs),
            input_enabled: self.input.enabled,
            signaling_timeout: Duration::from_secs(self.network.signaling_timeout_secs.max(1)),
            advertise_address: self.advertise_address(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
