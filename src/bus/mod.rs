//! Telemetry/control bus abstraction.
//!
//! The tuner talks to the mechanism over a hierarchical key/value bus with
//! polling-based change detection. The real client library is an external
//! collaborator; this module defines the seam ([`BusClient`]) plus two
//! in-tree implementations: [`InMemoryBus`], a loopback used by tests and
//! local runs, and [`NoopBus`], the inert stand-in for degraded mode.
//!
//! [`interface::TunerBus`] layers rate limiting, batching, shot-timestamp
//! deduplication, and the dashboard-control protocol on top of any client.

pub mod interface;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::TunerError;

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

/// Bus key paths. Hierarchy is by slash-separated prefix; the dashboard and
/// mechanism sides agree on these.
pub mod keys {
    /// Dashboard controls and status.
    pub const TUNER: &str = "/Tuning/ShotTuner";
    /// Parameter values the mechanism reads. Parameter bus keys nest here.
    pub const PARAMS: &str = "/Tuning";
    /// Shot telemetry published by the mechanism after each attempt.
    pub const SHOT: &str = "/LaunchSolver";
    /// Shooting interlock flags.
    pub const INTERLOCK: &str = "/LaunchSolver/Interlock";
    /// Field-control word; nonzero means a competition match is running.
    pub const MATCH_CONTROL: &str = "/FieldControl/ControlWord";

    pub const SHOT_TIMESTAMP: &str = "/LaunchSolver/ShotTimestamp";
    pub const SHOT_HIT: &str = "/LaunchSolver/Hit";
    pub const SHOT_DISTANCE: &str = "/LaunchSolver/Distance";
    pub const SHOT_ANGLE: &str = "/LaunchSolver/Solution/PitchRadians";
    pub const SHOT_VELOCITY: &str = "/LaunchSolver/Solution/ExitVelocity";
    pub const SHOT_YAW: &str = "/LaunchSolver/Solution/YawRadians";
    pub const SHOT_TARGET_HEIGHT: &str = "/LaunchSolver/TargetHeight";
    pub const SHOT_LAUNCH_HEIGHT: &str = "/LaunchSolver/LaunchHeight";

    pub const RUN_OPTIMIZATION: &str = "/Tuning/ShotTuner/RunOptimization";
    pub const SKIP_TO_NEXT: &str = "/Tuning/ShotTuner/SkipToNext";
    pub const GO_BACK: &str = "/Tuning/ShotTuner/GoBack";
    pub const RESET_SESSION: &str = "/Tuning/ShotTuner/ResetSession";
    pub const TUNER_ENABLED: &str = "/Tuning/ShotTuner/TunerEnabled";
    pub const TUNER_PAUSED: &str = "/Tuning/ShotTuner/TunerPaused";
    pub const TUNER_STATUS: &str = "/Tuning/ShotTuner/Status";
    pub const AUTOTUNE_ENABLED: &str = "/Tuning/ShotTuner/AutotuneEnabled";
    pub const SHOT_COUNT: &str = "/Tuning/ShotTuner/ShotCount";
    pub const SHOT_THRESHOLD: &str = "/Tuning/ShotTuner/ShotThreshold";
    pub const CURRENT_PARAMETER: &str = "/Tuning/ShotTuner/CurrentParameter";
    pub const CURRENT_AUTO_ADVANCE: &str = "/Tuning/ShotTuner/CurrentAutoAdvance";
    pub const CURRENT_STEP_SIZE: &str = "/Tuning/ShotTuner/CurrentStepSize";
    pub const CURRENT_ITERATION: &str = "/Tuning/ShotTuner/CurrentIteration";

    pub const NEW_GLOBAL_THRESHOLD: &str = "/Tuning/ShotTuner/NewGlobalThreshold";
    pub const UPDATE_GLOBAL_THRESHOLD: &str = "/Tuning/ShotTuner/UpdateGlobalThreshold";
    pub const NEW_LOCAL_THRESHOLD: &str = "/Tuning/ShotTuner/NewLocalThreshold";
    pub const UPDATE_LOCAL_THRESHOLD: &str = "/Tuning/ShotTuner/UpdateLocalThreshold";

    pub const MANUAL_ENABLED: &str = "/Tuning/ShotTuner/ManualControl/Enabled";
    pub const MANUAL_PARAMETER: &str = "/Tuning/ShotTuner/ManualControl/ParameterName";
    pub const MANUAL_VALUE: &str = "/Tuning/ShotTuner/ManualControl/NewValue";
    pub const MANUAL_APPLY: &str = "/Tuning/ShotTuner/ManualControl/Apply";

    pub const BACKTRACK_ENABLED: &str = "/Tuning/ShotTuner/Backtrack/Enabled";
    pub const BACKTRACK_TARGET: &str = "/Tuning/ShotTuner/Backtrack/TargetParameter";
    pub const BACKTRACK_TRIGGER: &str = "/Tuning/ShotTuner/Backtrack/Trigger";
    pub const BACKTRACK_TUNED: &str = "/Tuning/ShotTuner/Backtrack/TunedParameters";
    pub const BACKTRACK_ORDER: &str = "/Tuning/ShotTuner/Backtrack/TuningOrder";

    pub const INTERLOCK_REQUIRE_LOGGED: &str = "/LaunchSolver/Interlock/RequireShotLogged";
    pub const INTERLOCK_REQUIRE_UPDATED: &str = "/LaunchSolver/Interlock/RequireParamsUpdated";
    pub const INTERLOCK_PARAMS_UPDATED: &str = "/LaunchSolver/Interlock/ParamsUpdated";

    /// Live-values subtable; per-parameter subkeys nest under the name.
    pub const LIVE: &str = "/Tuning/ShotTuner/Live";
}

// ---------------------------------------------------------------------------
// BusClient trait
// ---------------------------------------------------------------------------

/// Minimal key/value client contract. Reads fall back to the caller's
/// default on missing keys; writes fail only on transport problems.
pub trait BusClient: Send {
    fn connect(&mut self, server: Option<&str>) -> Result<(), TunerError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    fn get_number(&self, key: &str, default: f64) -> f64;
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn get_string(&self, key: &str, default: &str) -> String;
    fn contains_key(&self, key: &str) -> bool;

    fn put_number(&mut self, key: &str, value: f64) -> Result<(), TunerError>;
    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), TunerError>;
    fn put_string(&mut self, key: &str, value: &str) -> Result<(), TunerError>;
}

// ---------------------------------------------------------------------------
// InMemoryBus
// ---------------------------------------------------------------------------

/// Bus entry value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
}

/// Loopback bus backed by a shared map. Cloning shares the store, so a test
/// (or a co-located simulator) can play the mechanism side while the tuner
/// holds its own handle.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    store: Arc<Mutex<BTreeMap<String, Value>>>,
    connected: Arc<Mutex<bool>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        // Lock poisoning means a panicked test thread; propagating the data
        // is still sound for a plain map.
        match self.store.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop every stored key. Test helper.
    pub fn clear(&self) {
        self.store().clear();
    }
}

impl BusClient for InMemoryBus {
    fn connect(&mut self, _server: Option<&str>) -> Result<(), TunerError> {
        if let Ok(mut c) = self.connected.lock() {
            *c = true;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Ok(mut c) = self.connected.lock() {
            *c = false;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.lock().map(|c| *c).unwrap_or(false)
    }

    fn get_number(&self, key: &str, default: f64) -> f64 {
        match self.store().get(key) {
            Some(Value::Num(v)) => *v,
            _ => default,
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.store().get(key) {
            Some(Value::Bool(v)) => *v,
            _ => default,
        }
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        match self.store().get(key) {
            Some(Value::Str(v)) => v.clone(),
            _ => default.to_string(),
        }
    }

    fn contains_key(&self, key: &str) -> bool {
        self.store().contains_key(key)
    }

    fn put_number(&mut self, key: &str, value: f64) -> Result<(), TunerError> {
        self.store().insert(key.to_string(), Value::Num(value));
        Ok(())
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), TunerError> {
        self.store().insert(key.to_string(), Value::Bool(value));
        Ok(())
    }

    fn put_string(&mut self, key: &str, value: &str) -> Result<(), TunerError> {
        self.store().insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NoopBus
// ---------------------------------------------------------------------------

/// Degraded-mode client: never connects, reads return defaults, writes
/// vanish. Lets the process run when no bus library or server exists.
#[derive(Debug, Default)]
pub struct NoopBus;

impl BusClient for NoopBus {
    fn connect(&mut self, _server: Option<&str>) -> Result<(), TunerError> {
        Err(TunerError::Disconnected)
    }

    fn disconnect(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }

    fn get_number(&self, _key: &str, default: f64) -> f64 {
        default
    }

    fn get_bool(&self, _key: &str, default: bool) -> bool {
        default
    }

    fn get_string(&self, _key: &str, default: &str) -> String {
        default.to_string()
    }

    fn contains_key(&self, _key: &str) -> bool {
        false
    }

    fn put_number(&mut self, _key: &str, _value: f64) -> Result<(), TunerError> {
        Ok(())
    }

    fn put_bool(&mut self, _key: &str, _value: bool) -> Result<(), TunerError> {
        Ok(())
    }

    fn put_string(&mut self, _key: &str, _value: &str) -> Result<(), TunerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_bus_round_trip() {
        let mut bus = InMemoryBus::new();
        bus.put_number("/a/b", 1.5).unwrap();
        bus.put_bool("/a/c", true).unwrap();
        bus.put_string("/a/d", "hi").unwrap();
        assert_eq!(bus.get_number("/a/b", 0.0), 1.5);
        assert!(bus.get_bool("/a/c", false));
        assert_eq!(bus.get_string("/a/d", ""), "hi");
    }

    #[test]
    fn test_missing_key_returns_default() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.get_number("/missing", 7.0), 7.0);
        assert!(!bus.contains_key("/missing"));
    }

    #[test]
    fn test_type_mismatch_returns_default() {
        let mut bus = InMemoryBus::new();
        bus.put_string("/k", "text").unwrap();
        assert_eq!(bus.get_number("/k", 3.0), 3.0);
        assert!(bus.get_bool("/k", true));
    }

    #[test]
    fn test_clones_share_the_store() {
        let mut a = InMemoryBus::new();
        let b = a.clone();
        a.put_number("/shared", 9.0).unwrap();
        assert_eq!(b.get_number("/shared", 0.0), 9.0);
    }

    #[test]
    fn test_connect_state_tracked() {
        let mut bus = InMemoryBus::new();
        assert!(!bus.is_connected());
        bus.connect(None).unwrap();
        assert!(bus.is_connected());
        bus.disconnect();
        assert!(!bus.is_connected());
    }

    #[test]
    fn test_noop_bus_never_connects() {
        let mut bus = NoopBus;
        assert!(bus.connect(None).is_err());
        assert!(!bus.is_connected());
        assert!(bus.put_number("/x", 1.0).is_ok());
        assert_eq!(bus.get_number("/x", 2.0), 2.0);
    }
}
