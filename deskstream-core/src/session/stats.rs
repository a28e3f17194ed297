//! Session-wide counters and smoothed timings.

use std::time::Duration;

use tracing::info;

/// Exponentially weighted moving average, `avg = avg * 0.9 + sample * 0.1`.
/// The first sample seeds the average.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Ewma {
    value: Option<f64>,
}

impl Ewma {
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(avg) => avg * 0.9 + sample * 0.1,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn update_duration(&mut self, elapsed: Duration) -> f64 {
        self.update(elapsed.as_secs_f64() * 1000.0)
    }

    /// `0.0` before the first sample.
    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Smoothed per-stage time in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub capture_ms: f64,
    pub encode_ms: f64,
    pub network_ms: f64,
    pub render_ms: f64,
}

/// Snapshot returned by
/// [`SessionOrchestrator::stats`](super::SessionOrchestrator::stats).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    /// Frames that made it through the mode's main stage: delivered for
    /// presentation (loopback, client) or sent (server).
    pub frames_processed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Queue rejections, oversized frames, failed sends and undecodable
    /// payloads.
    pub frames_dropped: u64,
    /// Render polls that found nothing to present.
    pub render_underruns: u64,
    /// Sequence gaps seen by a client.
    pub frames_lost: u64,
    pub malformed_packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Raw pixel bytes over wire payload bytes.
    pub compression_ratio: f64,
    pub timings: StageTimings,
    pub frame_time_ms: f64,
    /// `1000 / frame_time_ms`, zero until a frame time exists.
    pub fps: f64,
    pub current_bitrate_mbps: u32,
    pub bitrate_changes: u64,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    /// Collaborators brought back after a device loss.
    pub recoveries: u64,
    pub input_enabled: bool,
    /// Input events forwarded (client) or injected (server).
    pub input_events: u64,
}

impl SessionStats {
    pub fn fps_from_frame_time(frame_time_ms: f64) -> f64 {
        if frame_time_ms > 0.0 {
            1000.0 / frame_time_ms
        } else {
            0.0
        }
    }

    pub fn compression_ratio(raw_bytes: u64, wire_bytes: u64) -> f64 {
        if wire_bytes == 0 {
            0.0
        } else {
            raw_bytes as f64 / wire_bytes as f64
        }
    }

    pub fn log(&self, mode: &str) {
        info!(
            mode,
            fps = round(self.fps, 1),
            frame_ms = round(self.frame_time_ms, 2),
            capture_ms = round(self.timings.capture_ms, 2),
            encode_ms = round(self.timings.encode_ms, 2),
            network_ms = round(self.timings.network_ms, 2),
            render_ms = round(self.timings.render_ms, 2),
            processed = self.frames_processed,
            dropped = self.frames_dropped,
            lost = self.frames_lost,
            malformed = self.malformed_packets,
            sent_bytes = self.bytes_sent,
            received_bytes = self.bytes_received,
            ratio = round(self.compression_ratio, 2),
            bitrate_mbps = self.current_bitrate_mbps,
            latency_ms = round(self.latency_ms, 1),
            input_events = self.input_events,
            "session stats"
        );
    }
}

/// Trim a value to `digits` decimals for log output.
fn round(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_seeds_with_first_sample() {
        let mut avg = Ewma::default();
        assert_eq!(avg.value(), 0.0);
        assert_eq!(avg.update(20.0), 20.0);
        assert!((avg.update(10.0) - 19.0).abs() < 1e-9);
        assert!((avg.update_duration(Duration::from_millis(19)) - 19.0).abs() < 1e-9);
    }

    #[test]
    fn fps_derives_from_frame_time() {
        assert!((SessionStats::fps_from_frame_time(16.0) - 62.5).abs() < 1e-9);
        assert_eq!(SessionStats::fps_from_frame_time(0.0), 0.0);
    }

    #[test]
    fn compression_ratio_handles_empty_stream() {
        assert_eq!(SessionStats::compression_ratio(100, 0), 0.0);
        assert!((SessionStats::compression_ratio(100, 25) - 4.0).abs() < 1e-9);
    }
}
