//! Throughput measurement and adaptive bitrate control.
//!
//! [`BandwidthEstimator`] measures what the transport actually pushed out
//! over a rolling window. [`AdaptiveBitrateController`] turns receiver
//! telemetry into a target bitrate for the codec.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;

// ── BandwidthEstimator ───────────────────────────────────────────

/// Rolling-window throughput estimator over `(instant, bytes)` samples.
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
}

impl BandwidthEstimator {
    /// One-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(128),
            window,
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        while let Some(&(ts, old)) = self.samples.front() {
            if when.duration_since(ts) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total_bytes = self.total_bytes.saturating_sub(old);
        }
    }

    /// Bytes per second across the samples still in the window.
    pub fn estimate_bps(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let elapsed = last.duration_since(*first).max(Duration::from_millis(1));
        (self.total_bytes as f64 / elapsed.as_secs_f64()) as u64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Adaptive bitrate ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptationMode {
    /// Cuts hard on loss, never raises the bitrate.
    Conservative,
    #[default]
    Balanced,
    /// Only ever raises the bitrate.
    Aggressive,
}

/// Snapshot of the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbrStats {
    pub current_mbps: u32,
    pub previous_mbps: u32,
    pub min_mbps: u32,
    pub max_mbps: u32,
    pub mode: AdaptationMode,
    pub smoothed_latency_ms: f64,
    pub smoothed_loss_percent: f64,
    pub smoothed_buffer_ms: f64,
    pub bitrate_change_count: u64,
}

/// Adjusts the target bitrate (Mbps) from latency, loss and buffer depth.
///
/// At most one rule fires per [`update`](Self::update), decreases checked
/// first, and the result is clamped to `[min, max]`:
///
/// | mode         | decrease                                      | increase                         |
/// |--------------|-----------------------------------------------|----------------------------------|
/// | conservative | loss > 5 → ×0.70; loss > 0 ∧ lat > 100 → ×0.80 |                                  |
/// | balanced     | loss > 3 ∨ lat > 80 → ×0.85                   | loss < 1 ∧ lat < 50 → ×1.10      |
/// | aggressive   |                                               | loss < 0.5 ∧ lat < 40 → ×1.20    |
///
/// Scaling is integer `current * pct / 100`, truncating. The rules look at
/// the raw samples; the smoothed values only feed [`stats`](Self::stats).
///
/// Not synchronised: owned and updated by one thread.
#[derive(Debug, Clone)]
pub struct AdaptiveBitrateController {
    current: u32,
    previous: u32,
    min: u32,
    max: u32,
    mode: AdaptationMode,
    latency_ms: Option<f64>,
    loss_percent: Option<f64>,
    buffer_ms: Option<f64>,
    change_count: u64,
}

impl AdaptiveBitrateController {
    /// Start halfway between `min` and `max`.
    pub fn new(min_mbps: u32, max_mbps: u32) -> Result<Self, StreamError> {
        validate_range(min_mbps, max_mbps)?;
        let midpoint = min_mbps + (max_mbps - min_mbps) / 2;
        Self::with_initial(midpoint, min_mbps, max_mbps)
    }

    /// Start at `initial_mbps`, clamped into the range.
    pub fn with_initial(initial_mbps: u32, min_mbps: u32, max_mbps: u32) -> Result<Self, StreamError> {
        validate_range(min_mbps, max_mbps)?;
        let current = initial_mbps.clamp(min_mbps, max_mbps);
        Ok(Self {
            current,
            previous: current,
            min: min_mbps,
            max: max_mbps,
            mode: AdaptationMode::default(),
            latency_ms: None,
            loss_percent: None,
            buffer_ms: None,
            change_count: 0,
        })
    }

    /// Feed one telemetry sample and return the new target bitrate.
    pub fn update(&mut self, latency_ms: f64, loss_percent: f64, buffer_ms: f64) -> u32 {
        smooth(&mut self.latency_ms, latency_ms);
        smooth(&mut self.loss_percent, loss_percent);
        smooth(&mut self.buffer_ms, buffer_ms);

        let scale = match self.mode {
            AdaptationMode::Conservative => {
                if loss_percent > 5.0 {
                    Some(70)
                } else if loss_percent > 0.0 && latency_ms > 100.0 {
                    Some(80)
                } else {
                    None
                }
            }
            AdaptationMode::Balanced => {
                if loss_percent > 3.0 || latency_ms > 80.0 {
                    Some(85)
                } else if loss_percent < 1.0 && latency_ms < 50.0 {
                    Some(110)
                } else {
                    None
                }
            }
            AdaptationMode::Aggressive => {
                (loss_percent < 0.5 && latency_ms < 40.0).then_some(120)
            }
        };

        if let Some(pct) = scale {
            let scaled = (self.current as u64 * pct / 100).min(u32::MAX as u64) as u32;
            self.apply(scaled.clamp(self.min, self.max));
        }
        self.current
    }

    pub fn set_adaptation_mode(&mut self, mode: AdaptationMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> AdaptationMode {
        self.mode
    }

    /// Replace the bounds and re-clamp the current bitrate.
    pub fn set_bitrate_range(&mut self, min_mbps: u32, max_mbps: u32) -> Result<(), StreamError> {
        validate_range(min_mbps, max_mbps)?;
        self.min = min_mbps;
        self.max = max_mbps;
        self.apply(self.current.clamp(min_mbps, max_mbps));
        Ok(())
    }

    pub fn current_bitrate(&self) -> u32 {
        self.current
    }

    pub fn previous_bitrate(&self) -> u32 {
        self.previous
    }

    pub fn stats(&self) -> AbrStats {
        AbrStats {
            current_mbps: self.current,
            previous_mbps: self.previous,
            min_mbps: self.min,
            max_mbps: self.max,
            mode: self.mode,
            smoothed_latency_ms: self.latency_ms.unwrap_or_default(),
            smoothed_loss_percent: self.loss_percent.unwrap_or_default(),
            smoothed_buffer_ms: self.buffer_ms.unwrap_or_default(),
            bitrate_change_count: self.change_count,
        }
    }

    fn apply(&mut self, next: u32) {
        if next == self.current {
            return;
        }
        debug!(from = self.current, to = next, mode = ?self.mode, "bitrate changed");
        self.previous = self.current;
        self.current = next;
        self.change_count += 1;
    }
}

fn validate_range(min: u32, max: u32) -> Result<(), StreamError> {
    if min == 0 {
        return Err(StreamError::InvalidConfig("minimum bitrate must be positive".into()));
    }
    if min > max {
        return Err(StreamError::InvalidConfig(format!(
            "bitrate range is empty: {min} > {max}"
        )));
    }
    Ok(())
}

fn smooth(slot: &mut Option<f64>, sample: f64) {
    *slot = Some(match *slot {
        Some(avg) => avg * 0.9 + sample * 0.1,
        None => sample,
    });
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_estimator_returns_zero() {
        assert_eq!(BandwidthEstimator::new().estimate_bps(), 0);
    }

    #[test]
    fn two_samples_one_second_apart() {
        let mut est = BandwidthEstimator::with_window(Duration::from_secs(5));
        let t0 = Instant::now();
        est.record_at(t0, 1_000_000);
        est.record_at(t0 + Duration::from_secs(1), 1_000_000);
        let bps = est.estimate_bps();
        assert!((1_900_000..=2_100_000).contains(&bps), "bps = {bps}");
    }

    #[test]
    fn evicts_old_samples() {
        let mut est = BandwidthEstimator::with_window(Duration::from_millis(500));
        let t0 = Instant::now();
        est.record_at(t0, 1000);
        est.record_at(t0 + Duration::from_secs(1), 500);
        assert_eq!(est.sample_count(), 1);
    }

    #[test]
    fn balanced_sequence_is_deterministic() {
        let mut abr = AdaptiveBitrateController::with_initial(50, 5, 100).unwrap();
        assert_eq!(abr.update(90.0, 4.0, 0.0), 42);
        assert_eq!(abr.update(30.0, 0.5, 0.0), 46);
        assert_eq!(abr.previous_bitrate(), 42);
        assert_eq!(abr.stats().bitrate_change_count, 2);
    }

    #[test]
    fn new_starts_at_midpoint() {
        let abr = AdaptiveBitrateController::new(10, 100).unwrap();
        assert_eq!(abr.current_bitrate(), 55);
    }

    #[test]
    fn conservative_never_increases() {
        let mut abr = AdaptiveBitrateController::with_initial(50, 5, 100).unwrap();
        abr.set_adaptation_mode(AdaptationMode::Conservative);
        assert_eq!(abr.update(10.0, 0.0, 0.0), 50);
        assert_eq!(abr.update(10.0, 6.0, 0.0), 35);
        assert_eq!(abr.update(150.0, 1.0, 0.0), 28);
        // High latency without loss is left alone.
        assert_eq!(abr.update(150.0, 0.0, 0.0), 28);
    }

    #[test]
    fn aggressive_only_increases() {
        let mut abr = AdaptiveBitrateController::with_initial(50, 5, 100).unwrap();
        abr.set_adaptation_mode(AdaptationMode::Aggressive);
        assert_eq!(abr.update(500.0, 50.0, 0.0), 50);
        assert_eq!(abr.update(20.0, 0.0, 0.0), 60);
    }

    #[test]
    fn balanced_dead_band_keeps_bitrate() {
        let mut abr = AdaptiveBitrateController::with_initial(50, 5, 100).unwrap();
        assert_eq!(abr.update(60.0, 2.0, 0.0), 50);
        assert_eq!(abr.stats().bitrate_change_count, 0);
    }

    #[test]
    fn increase_is_clamped_to_max() {
        let mut abr = AdaptiveBitrateController::with_initial(95, 5, 100).unwrap();
        assert_eq!(abr.update(10.0, 0.0, 0.0), 100);
        assert_eq!(abr.update(10.0, 0.0, 0.0), 100);
        assert_eq!(abr.stats().bitrate_change_count, 1);
    }

    #[test]
    fn range_change_reclamps() {
        let mut abr = AdaptiveBitrateController::with_initial(50, 5, 100).unwrap();
        abr.set_bitrate_range(5, 20).unwrap();
        assert_eq!(abr.current_bitrate(), 20);
        assert_eq!(abr.previous_bitrate(), 50);
        assert!(abr.set_bitrate_range(0, 10).is_err());
        assert!(abr.set_bitrate_range(30, 10).is_err());
        assert_eq!(abr.stats().max_mbps, 20);
    }

    #[test]
    fn invalid_construction_is_rejected() {
        assert!(matches!(
            AdaptiveBitrateController::new(0, 10),
            Err(StreamError::InvalidConfig(_))
        ));
        assert!(AdaptiveBitrateController::with_initial(5, 20, 10).is_err());
        let abr = AdaptiveBitrateController::with_initial(500, 5, 100).unwrap();
        assert_eq!(abr.current_bitrate(), 100);
    }

    #[test]
    fn smoothing_is_statistics_only() {
        let mut abr = AdaptiveBitrateController::with_initial(50, 5, 100).unwrap();
        abr.update(100.0, 10.0, 20.0);
        abr.update(0.0, 0.0, 0.0);
        let stats = abr.stats();
        assert!((stats.smoothed_latency_ms - 90.0).abs() < 1e-9);
        assert!((stats.smoothed_loss_percent - 9.0).abs() < 1e-9);
        assert!((stats.smoothed_buffer_ms - 18.0).abs() < 1e-9);
    }

    fn mode_strategy() -> impl Strategy<Value = AdaptationMode> {
        prop_oneof![
            Just(AdaptationMode::Conservative),
            Just(AdaptationMode::Balanced),
            Just(AdaptationMode::Aggressive),
        ]
    }

    proptest! {
        #[test]
        fn bitrate_stays_in_range(
            min in 1u32..50,
            span in 0u32..200,
            initial in 0u32..400,
            mode in mode_strategy(),
            samples in proptest::collection::vec((0.0f64..300.0, 0.0f64..20.0, 0.0f64..500.0), 0..100),
        ) {
            let max = min + span;
            let mut abr = AdaptiveBitrateController::with_initial(initial, min, max).unwrap();
            abr.set_adaptation_mode(mode);
            prop_assert!(abr.current_bitrate() >= min && abr.current_bitrate() <= max);
            let mut last_count = 0;
            for (latency, loss, buffer) in samples {
                let rate = abr.update(latency, loss, buffer);
                prop_assert!(rate >= min && rate <= max);
                let count = abr.stats().bitrate_change_count;
                prop_assert!(count >= last_count);
                last_count = count;
            }
        }
    }
}
