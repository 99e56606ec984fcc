//! # Stage: Shot Sample Validation
//!
//! Responsibility: represent one observed shot outcome and decide whether it
//! is physically plausible.
//!
//! Guarantees:
//! - Non-finite or out-of-bounds distance/velocity/angle never reaches the
//!   aggregator.
//!
//! NOT Responsible For:
//! - Timestamp deduplication (done at the bus read, where the last-seen
//!   timestamp lives).
//! - The consecutive-invalid counter (coordinator state).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::PhysicalBounds;
use crate::error::TunerError;

// ---------------------------------------------------------------------------
// ShotSample
// ---------------------------------------------------------------------------

/// One observed shot, as published by the mechanism after each attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotSample {
    pub hit: bool,
    /// Horizontal distance to the target, meters.
    pub distance_m: f64,
    /// Launch angle, radians.
    pub angle_rad: f64,
    /// Exit velocity, meters per second.
    pub velocity_mps: f64,
    /// Mechanism clock at the moment of the shot, seconds.
    pub timestamp: f64,
    /// Chassis yaw at the shot, radians.
    pub yaw_rad: f64,
    /// Target height above the floor, meters.
    pub target_height_m: f64,
    /// Launch height above the floor, meters.
    pub launch_height_m: f64,
    /// Every tunable parameter's value in effect when the shot was taken.
    pub parameter_values: BTreeMap<String, f64>,
}

impl ShotSample {
    /// Check physical plausibility against the configured bounds.
    ///
    /// Timestamp ordering is not checked here — duplicate suppression
    /// happens where the sample is read off the bus.
    pub fn validate(&self, bounds: &PhysicalBounds) -> Result<(), TunerError> {
        check_field("distance", self.distance_m, bounds.min_distance_m, bounds.max_distance_m)?;
        check_field("velocity", self.velocity_mps, bounds.min_velocity_mps, bounds.max_velocity_mps)?;
        check_field("angle", self.angle_rad, bounds.min_angle_rad, bounds.max_angle_rad)?;
        Ok(())
    }
}

fn check_field(label: &str, v: f64, min: f64, max: f64) -> Result<(), TunerError> {
    if !v.is_finite() {
        return Err(TunerError::InvalidSample(format!("{label} is not finite: {v}")));
    }
    if v < min || v > max {
        return Err(TunerError::InvalidSample(format!(
            "{label} {v} outside [{min}, {max}]"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
