//! # Stage: Sample Aggregation
//!
//! Responsibility: buffer validated shots for the parameter currently under
//! tuning and collapse a batch into one observation for the optimizer.
//!
//! Guarantees:
//! - Majority vote is strict: ties count as a miss.
//! - A flush always clears the buffer.
//! - Buffered samples belong to exactly one parameter; switching parameters
//!   discards the buffer without reporting it.
//!
//! NOT Responsible For:
//! - Deciding *when* to flush (the coordinator compares `len()` against the
//!   effective thresholds).

use crate::tuning::sample::ShotSample;

// ---------------------------------------------------------------------------
// AggregatedObservation
// ---------------------------------------------------------------------------

/// One batch of shots collapsed into a single optimizer observation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedObservation {
    /// Mean of the parameter values the shots were taken under.
    pub avg_value: f64,
    /// Strict-majority verdict.
    pub hit: bool,
    /// Mean shot distance, for the distance-weighted score adjustment.
    pub avg_distance: f64,
    pub batch_size: usize,
    pub hit_rate: f64,
}

// ---------------------------------------------------------------------------
// SampleAggregator
// ---------------------------------------------------------------------------

/// Buffers `(sample, parameter value)` pairs until the coordinator flushes.
#[derive(Debug, Default)]
pub struct SampleAggregator {
    buffer: Vec<(ShotSample, f64)>,
}

impl SampleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one validated shot taken under `parameter_value`.
    pub fn push(&mut self, sample: ShotSample, parameter_value: f64) {
        self.buffer.push((sample, parameter_value));
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True when every buffered shot was a hit. Used by auto-advance, which
    /// demands a clean streak rather than a majority.
    pub fn all_hits(&self) -> bool {
        !self.buffer.is_empty() && self.buffer.iter().all(|(s, _)| s.hit)
    }

    /// Discard buffered samples without reporting them. Used on parameter
    /// switches and manual overrides.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Collapse and clear the buffer. Returns `None` when empty.
    pub fn flush(&mut self) -> Option<AggregatedObservation> {
        if self.buffer.is_empty() {
            return None;
        }
        let n = self.buffer.len();
        let hits = self.buffer.iter().filter(|(s, _)| s.hit).count();
        let sum_value: f64 = self.buffer.iter().map(|(_, v)| v).sum();
        let sum_distance: f64 = self.buffer.iter().map(|(s, _)| s.distance_m).sum();
        self.buffer.clear();

        Some(AggregatedObservation {
            avg_value: sum_value / n as f64,
            hit: hits * 2 > n,
            avg_distance: sum_distance / n as f64,
            batch_size: n,
            hit_rate: hits as f64 / n as f64,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn shot(hit: bool, distance: f64) -> ShotSample {
        ShotSample {
            hit,
            distance_m: distance,
            angle_rad: 0.8,
            velocity_mps: 12.0,
            timestamp: 0.0,
            yaw_rad: 0.0,
            target_height_m: 2.0,
            launch_height_m: 0.8,
            parameter_values: BTreeMap::new(),
        }
    }

    // ===== Majority vote =====

    #[test]
    fn test_two_of_three_hits_is_hit() {
        let mut agg = SampleAggregator::new();
        agg.push(shot(true, 4.0), 0.003);
        agg.push(shot(true, 4.0), 0.003);
        agg.push(shot(false, 4.0), 0.003);
        let obs = agg.flush().unwrap();
        assert!(obs.hit);
        assert_eq!(obs.batch_size, 3);
    }

    #[test]
    fn test_tie_counts_as_miss() {
        let mut agg = SampleAggregator::new();
        agg.push(shot(true, 4.0), 0.003);
        agg.push(shot(false, 4.0), 0.003);
        let obs = agg.flush().unwrap();
        assert!(!obs.hit);
        assert_eq!(obs.hit_rate, 0.5);
    }

    // ===== Averaging =====

    #[test]
    fn test_averages_value_and_distance() {
        let mut agg = SampleAggregator::new();
        agg.push(shot(true, 2.0), 0.002);
        agg.push(shot(true, 6.0), 0.004);
        let obs = agg.flush().unwrap();
        assert!((obs.avg_value - 0.003).abs() < 1e-12);
        assert!((obs.avg_distance - 4.0).abs() < 1e-12);
    }

    // ===== Buffer lifecycle =====

    #[test]
    fn test_flush_clears_buffer() {
        let mut agg = SampleAggregator::new();
        agg.push(shot(true, 4.0), 0.003);
        assert!(agg.flush().is_some());
        assert!(agg.is_empty());
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_flush_empty_is_none() {
        let mut agg = SampleAggregator::new();
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_clear_discards_without_reporting() {
        let mut agg = SampleAggregator::new();
        agg.push(shot(true, 4.0), 0.003);
        agg.push(shot(false, 4.0), 0.003);
        agg.clear();
        assert!(agg.is_empty());
    }

    // ===== all_hits =====

    #[test]
    fn test_all_hits_streak() {
        let mut agg = SampleAggregator::new();
        agg.push(shot(true, 4.0), 0.003);
        agg.push(shot(true, 4.0), 0.003);
        assert!(agg.all_hits());
        agg.push(shot(false, 4.0), 0.003);
        assert!(!agg.all_hits());
    }

    #[test]
    fn test_all_hits_false_on_empty_buffer() {
        assert!(!SampleAggregator::new().all_hits());
    }
}
