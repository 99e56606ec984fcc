//! Tuner configuration.
//!
//! Everything the coordinator needs at startup lives in [`TunerConfig`]:
//! the ordered parameter set with per-parameter override bundles, the global
//! toggles those bundles fall back to, physical shot-validity bounds, bus
//! rate ceilings, and the optimizer settings.
//!
//! Configuration is an explicit struct handed by reference into the resolver
//! on every tick — never ambient global state. Runtime edits (threshold
//! updates, override activation) go through the coordinator's guarded
//! mutation entry points.
//!
//! Override priority, highest first:
//! 1. `force_global` on the global toggles — every parameter uses the global
//!    settings, local overrides are ignored
//! 2. `active = true` on a parameter's local bundle — that parameter uses
//!    its local settings
//! 3. the global defaults

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::TunerError;

// ---------------------------------------------------------------------------
// OverrideBundle — one local override (autotune or auto-advance)
// ---------------------------------------------------------------------------

/// A per-parameter local override for one feature (autotune or auto-advance).
///
/// Only consulted when `active` is true and the corresponding global
/// `force_global` flag is false.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideBundle {
    /// Whether the local settings take precedence over the globals.
    pub active: bool,
    /// Local enabled flag.
    pub enabled: bool,
    /// Local shot threshold.
    pub shot_threshold: u32,
}

impl Default for OverrideBundle {
    fn default() -> Self {
        Self { active: false, enabled: false, shot_threshold: 10 }
    }
}

// ---------------------------------------------------------------------------
// ParameterSpec — one tunable launch parameter
// ---------------------------------------------------------------------------

/// Static description of a single tunable parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSpec {
    /// Identity, e.g. `drag_coefficient`.
    pub name: String,
    /// Whether this parameter participates in the tuning sequence.
    pub enabled: bool,
    /// Starting value when the mechanism has none published.
    pub default_value: f64,
    /// Safety limit — candidates never go below this.
    pub min_value: f64,
    /// Safety limit — candidates never go above this.
    pub max_value: f64,
    /// Magnitude of the first adjustments; decays over iterations.
    pub initial_step_size: f64,
    /// Per-iteration decay applied to the step size (0.9 = slow, 0.5 = fast).
    pub step_decay_rate: f64,
    /// Candidates are rounded to whole numbers (e.g. solver iteration counts).
    pub is_integer: bool,
    /// Bus key the mechanism reads this parameter from.
    pub bus_key: String,
    /// Local autotune override.
    pub autotune: OverrideBundle,
    /// Local auto-advance override. Independent of `autotune`.
    pub auto_advance: OverrideBundle,
}

impl Default for ParameterSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            default_value: 0.0,
            min_value: 0.0,
            max_value: 1.0,
            initial_step_size: 0.1,
            step_decay_rate: 0.9,
            is_integer: false,
            bus_key: String::new(),
            autotune: OverrideBundle::default(),
            auto_advance: OverrideBundle::default(),
        }
    }
}

impl ParameterSpec {
    /// Clamp a candidate value to `[min_value, max_value]`.
    pub fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.min_value, self.max_value)
    }

    /// Clamp, and round to a whole number for integer parameters.
    pub fn constrain(&self, v: f64) -> f64 {
        let v = if self.is_integer { v.round() } else { v };
        self.clamp(v)
    }

    /// Check the load-time invariant `min <= default <= max`.
    pub fn validate(&self) -> Result<(), TunerError> {
        if self.name.is_empty() {
            return Err(TunerError::Config("parameter with empty name".into()));
        }
        if !(self.min_value <= self.default_value && self.default_value <= self.max_value) {
            return Err(TunerError::Config(format!(
                "`{}`: default {} outside bounds [{}, {}]",
                self.name, self.default_value, self.min_value, self.max_value
            )));
        }
        if self.min_value >= self.max_value {
            return Err(TunerError::Config(format!(
                "`{}`: min {} >= max {}",
                self.name, self.min_value, self.max_value
            )));
        }
        if self.initial_step_size <= 0.0 {
            return Err(TunerError::Config(format!(
                "`{}`: initial_step_size must be > 0",
                self.name
            )));
        }
        if !(0.0 < self.step_decay_rate && self.step_decay_rate < 1.0) {
            return Err(TunerError::Config(format!(
                "`{}`: step_decay_rate must be in (0, 1)",
                self.name
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GlobalToggles — global defaults the local bundles fall back to
// ---------------------------------------------------------------------------

/// Global autotune / auto-advance defaults and force flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalToggles {
    /// Master switch; also toggled at runtime from the dashboard.
    pub tuner_enabled: bool,
    /// Autotune mode: optimize automatically at the shot threshold.
    pub autotune_enabled: bool,
    pub autotune_shot_threshold: u32,
    /// Ignore every local autotune override.
    pub autotune_force_global: bool,
    /// Auto-advance: skip to the next parameter on a 100% hit streak.
    pub auto_advance_enabled: bool,
    pub auto_advance_shot_threshold: u32,
    /// Ignore every local auto-advance override.
    pub auto_advance_force_global: bool,
}

impl Default for GlobalToggles {
    fn default() -> Self {
        Self {
            tuner_enabled: true,
            autotune_enabled: false,
            autotune_shot_threshold: 10,
            autotune_force_global: false,
            auto_advance_enabled: false,
            auto_advance_shot_threshold: 10,
            auto_advance_force_global: false,
        }
    }
}

// ---------------------------------------------------------------------------
// PhysicalBounds — shot-sample plausibility limits
// ---------------------------------------------------------------------------

/// Hard limits used to reject obviously invalid shot data. These should
/// match the mechanism's actual physical capabilities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalBounds {
    pub min_distance_m: f64,
    pub max_distance_m: f64,
    pub min_velocity_mps: f64,
    pub max_velocity_mps: f64,
    pub min_angle_rad: f64,
    pub max_angle_rad: f64,
}

impl Default for PhysicalBounds {
    fn default() -> Self {
        Self {
            min_distance_m: 1.0,
            max_distance_m: 10.0,
            min_velocity_mps: 5.0,
            max_velocity_mps: 30.0,
            min_angle_rad: 0.17, // ~10 degrees
            max_angle_rad: 1.57, // ~90 degrees
        }
    }
}

// ---------------------------------------------------------------------------
// BusLimits — controller-protection rate ceilings
// ---------------------------------------------------------------------------

/// Rate limits protecting the mechanism's controller from bus overload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BusLimits {
    /// Max parameter writes per second.
    pub max_write_hz: f64,
    /// Max shot-data reads per second.
    pub max_read_hz: f64,
    /// Queue writes that exceed the ceiling for a later flush instead of
    /// dropping them.
    pub batch_writes: bool,
    /// Seconds to wait between reconnection attempts while disconnected.
    pub reconnect_delay_secs: f64,
}

impl Default for BusLimits {
    fn default() -> Self {
        Self {
            max_write_hz: 5.0,
            max_read_hz: 20.0,
            batch_writes: true,
            reconnect_delay_secs: 5.0,
        }
    }
}

impl BusLimits {
    /// The rates become `Duration` divisors, so zero, negative, or
    /// non-finite values must never get past load.
    pub fn validate(&self) -> Result<(), TunerError> {
        if !(self.max_write_hz.is_finite() && self.max_write_hz > 0.0) {
            return Err(TunerError::Config(format!(
                "bus.max_write_hz must be positive, got {}",
                self.max_write_hz
            )));
        }
        if !(self.max_read_hz.is_finite() && self.max_read_hz > 0.0) {
            return Err(TunerError::Config(format!(
                "bus.max_read_hz must be positive, got {}",
                self.max_read_hz
            )));
        }
        if !(self.reconnect_delay_secs.is_finite() && self.reconnect_delay_secs >= 0.0) {
            return Err(TunerError::Config(format!(
                "bus.reconnect_delay_secs must be >= 0, got {}",
                self.reconnect_delay_secs
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OptimizerSettings
// ---------------------------------------------------------------------------

/// Behavior of the sequential optimization wrapper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Random exploration points before the engine exploits.
    pub n_initial_points: u32,
    /// Iteration cap per parameter run; convergence triggers here even if
    /// score variance is still high.
    pub calls_per_parameter: u32,
    /// Floor for step decay, as a fraction of the initial step size.
    pub min_step_ratio: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self { n_initial_points: 5, calls_per_parameter: 20, min_step_ratio: 0.1 }
    }
}

// ---------------------------------------------------------------------------
// InterlockSettings
// ---------------------------------------------------------------------------

/// Shooting-interlock requirements published to the mechanism at startup.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockSettings {
    /// Mechanism must wait for each shot to be logged before firing again.
    pub require_shot_logged: bool,
    /// Mechanism must wait for a parameter update between shots.
    pub require_params_updated: bool,
}

// ---------------------------------------------------------------------------
// TunerConfig — the root
// ---------------------------------------------------------------------------

/// Root configuration. `params` is the tuning order; disabled entries are
/// skipped when the sequence is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub params: Vec<ParameterSpec>,
    pub global: GlobalToggles,
    pub physical: PhysicalBounds,
    pub bus: BusLimits,
    pub optimizer: OptimizerSettings,
    pub interlock: InterlockSettings,
    /// Control-loop rate.
    pub tick_hz: f64,
    /// Consecutive invalid samples before the session is declared broken.
    pub max_consecutive_invalid: u32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            params: default_parameter_set(),
            global: GlobalToggles::default(),
            physical: PhysicalBounds::default(),
            bus: BusLimits::default(),
            optimizer: OptimizerSettings::default(),
            interlock: InterlockSettings::default(),
            tick_hz: 10.0,
            max_consecutive_invalid: 5,
        }
    }
}

impl TunerConfig {
    /// Parse from a TOML string. Missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, TunerError> {
        let cfg: TunerConfig =
            toml::from_str(s).map_err(|e| TunerError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, TunerError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Validate every parameter spec and the loop settings. A violation here
    /// is a misconfiguration and fatal at load.
    pub fn validate(&self) -> Result<(), TunerError> {
        if self.tick_hz <= 0.0 {
            return Err(TunerError::Config("tick_hz must be > 0".into()));
        }
        if self.max_consecutive_invalid == 0 {
            return Err(TunerError::Config("max_consecutive_invalid must be > 0".into()));
        }
        self.bus.validate()?;
        for spec in &self.params {
            spec.validate()?;
        }
        Ok(())
    }

    /// The enabled parameters in tuning order.
    pub fn enabled_in_order(&self) -> Vec<ParameterSpec> {
        self.params.iter().filter(|p| p.enabled).cloned().collect()
    }

    /// Look up a parameter spec by name.
    pub fn param(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Mutable lookup, used by the coordinator's guarded runtime edits.
    pub fn param_mut(&mut self, name: &str) -> Option<&mut ParameterSpec> {
        self.params.iter_mut().find(|p| p.name == name)
    }
}

/// The built-in launch-parameter set, in tuning order. The most impactful
/// parameter (drag) comes first; physical measurements rarely need tuning
/// and come last.
fn default_parameter_set() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec {
            name: "drag_coefficient".into(),
            enabled: true,
            default_value: 0.003,
            min_value: 0.001,
            max_value: 0.006,
            initial_step_size: 0.001,
            step_decay_rate: 0.9,
            is_integer: false,
            bus_key: "DragCoefficient".into(),
            ..ParameterSpec::default()
        },
        ParameterSpec {
            name: "velocity_iteration_count".into(),
            enabled: true,
            default_value: 20.0,
            min_value: 10.0,
            max_value: 30.0,
            initial_step_size: 5.0,
            step_decay_rate: 0.85,
            is_integer: true,
            bus_key: "VelocityIterations".into(),
            ..ParameterSpec::default()
        },
        ParameterSpec {
            name: "angle_iteration_count".into(),
            enabled: true,
            default_value: 20.0,
            min_value: 10.0,
            max_value: 30.0,
            initial_step_size: 5.0,
            step_decay_rate: 0.85,
            is_integer: true,
            bus_key: "AngleIterations".into(),
            ..ParameterSpec::default()
        },
        ParameterSpec {
            name: "velocity_tolerance".into(),
            enabled: true,
            default_value: 0.01,
            min_value: 0.005,
            max_value: 0.05,
            initial_step_size: 0.005,
            step_decay_rate: 0.9,
            is_integer: false,
            bus_key: "VelocityTolerance".into(),
            ..ParameterSpec::default()
        },
        ParameterSpec {
            name: "angle_tolerance".into(),
            enabled: true,
            default_value: 0.0001,
            min_value: 0.00001,
            max_value: 0.001,
            initial_step_size: 0.0001,
            step_decay_rate: 0.9,
            is_integer: false,
            bus_key: "AngleTolerance".into(),
            ..ParameterSpec::default()
        },
        ParameterSpec {
            name: "launch_height".into(),
            enabled: true,
            default_value: 0.8,
            min_value: 0.75,
            max_value: 0.85,
            initial_step_size: 0.02,
            step_decay_rate: 0.9,
            is_integer: false,
            bus_key: "LaunchHeight".into(),
            ..ParameterSpec::default()
        },
        // Air density is essentially constant at sea level; kept in the set
        // for high-altitude venues but disabled by default.
        ParameterSpec {
            name: "air_density".into(),
            enabled: false,
            default_value: 1.225,
            min_value: 1.10,
            max_value: 1.30,
            initial_step_size: 0.05,
            step_decay_rate: 0.9,
            is_integer: false,
            bus_key: "AirDensity".into(),
            ..ParameterSpec::default()
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
