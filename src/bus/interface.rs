//! # Stage: Bus Interface
//!
//! Responsibility: the tuner-side protocol on top of a raw [`BusClient`] —
//! rate ceilings protecting the mechanism's controller, write batching,
//! shot-timestamp deduplication, one-shot dashboard buttons, and status
//! publication.
//!
//! Guarantees:
//! - Parameter writes never exceed the configured ceiling; excess writes are
//!   queued (batching on) or dropped (batching off), never blocked on.
//! - Shot reads never exceed the read ceiling.
//! - A shot is surfaced at most once: the timestamp must strictly exceed the
//!   last accepted one.
//! - Buttons are one-shot: a read that sees `true` resets the key to `false`.
//!
//! NOT Responsible For:
//! - Sample validation, aggregation, or any tuning decision.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::{keys, BusClient};
use crate::config::{BusLimits, InterlockSettings, ParameterSpec};
use crate::error::TunerError;
use crate::tuning::sample::ShotSample;

// ---------------------------------------------------------------------------
// TunerBus
// ---------------------------------------------------------------------------

/// Protocol wrapper around any bus client.
pub struct TunerBus<C: BusClient> {
    client: C,
    limits: BusLimits,
    min_write_interval: Duration,
    min_read_interval: Duration,
    reconnect_delay: Duration,
    server: Option<String>,
    last_connect_attempt: Option<Instant>,
    last_write: Option<Instant>,
    last_shot_read: Option<Instant>,
    pending_writes: BTreeMap<String, f64>,
    last_shot_timestamp: f64,
    last_enabled_value: Option<bool>,
}

impl<C: BusClient> TunerBus<C> {
    pub fn new(client: C, limits: BusLimits) -> Self {
        Self {
            client,
            min_write_interval: Duration::from_secs_f64(1.0 / limits.max_write_hz),
            min_read_interval: Duration::from_secs_f64(1.0 / limits.max_read_hz),
            reconnect_delay: Duration::from_secs_f64(limits.reconnect_delay_secs),
            limits,
            server: None,
            last_connect_attempt: None,
            last_write: None,
            last_shot_read: None,
            pending_writes: BTreeMap::new(),
            last_shot_timestamp: 0.0,
            last_enabled_value: None,
        }
    }

    pub fn connect(&mut self, server: Option<&str>) -> Result<(), TunerError> {
        self.server = server.map(str::to_string);
        self.last_connect_attempt = Some(Instant::now());
        self.client.connect(server)
    }

    /// Attempt a reconnect to the last-used server, at most once per
    /// configured delay. Returns whether the client is connected afterwards.
    pub fn try_reconnect(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_connect_attempt {
            if now.duration_since(last) < self.reconnect_delay {
                return false;
            }
        }
        self.last_connect_attempt = Some(now);
        match self.client.connect(self.server.as_deref()) {
            Ok(()) => {
                info!(target: "tuner::bus", "bus reconnected");
                true
            }
            Err(e) => {
                debug!(target: "tuner::bus", error = %e, "reconnect attempt failed");
                false
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Pending batched writes awaiting a flush.
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    fn param_key(bus_key: &str) -> String {
        format!("{}/{}", keys::PARAMS, bus_key)
    }

    // ----- parameter writes -------------------------------------------------

    /// Write one parameter value, subject to the write ceiling unless
    /// `force` is set. Returns whether the value actually went out.
    pub fn write_parameter(
        &mut self,
        bus_key: &str,
        value: f64,
        force: bool,
    ) -> Result<bool, TunerError> {
        if !self.client.is_connected() {
            warn!(target: "tuner::bus", bus_key, "not connected, write dropped");
            return Ok(false);
        }

        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_write {
                if now.duration_since(last) < self.min_write_interval {
                    if self.limits.batch_writes {
                        debug!(target: "tuner::bus", bus_key, "rate limited, write queued");
                        self.pending_writes.insert(bus_key.to_string(), value);
                    } else {
                        debug!(target: "tuner::bus", bus_key, "rate limited, write dropped");
                    }
                    return Ok(false);
                }
            }
        }

        self.client.put_number(&Self::param_key(bus_key), value)?;
        self.last_write = Some(now);
        info!(target: "tuner::bus", bus_key, value, "wrote parameter");
        Ok(true)
    }

    /// Force out every queued write. Returns how many went.
    pub fn flush_pending(&mut self) -> Result<usize, TunerError> {
        if self.pending_writes.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut self.pending_writes);
        let mut count = 0;
        for (bus_key, value) in pending {
            if self.write_parameter(&bus_key, value, true)? {
                count += 1;
            }
        }
        if count > 0 {
            info!(target: "tuner::bus", count, "flushed batched writes");
        }
        Ok(count)
    }

    // ----- shot telemetry ---------------------------------------------------

    /// Poll for a new shot, subject to the read ceiling. `specs` names the
    /// parameters whose live values get captured into the sample.
    ///
    /// Returns `None` when rate limited, disconnected, or no shot newer than
    /// the last accepted one is available.
    pub fn read_shot(&mut self, specs: &[ParameterSpec]) -> Option<ShotSample> {
        if !self.client.is_connected() {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = self.last_shot_read {
            if now.duration_since(last) < self.min_read_interval {
                return None;
            }
        }
        self.last_shot_read = Some(now);

        let timestamp = self.client.get_number(keys::SHOT_TIMESTAMP, 0.0);
        if timestamp <= self.last_shot_timestamp {
            return None;
        }

        let mut parameter_values = BTreeMap::new();
        for spec in specs {
            let value =
                self.client.get_number(&Self::param_key(&spec.bus_key), spec.default_value);
            parameter_values.insert(spec.name.clone(), value);
        }

        let sample = ShotSample {
            hit: self.client.get_bool(keys::SHOT_HIT, false),
            distance_m: self.client.get_number(keys::SHOT_DISTANCE, 0.0),
            angle_rad: self.client.get_number(keys::SHOT_ANGLE, 0.0),
            velocity_mps: self.client.get_number(keys::SHOT_VELOCITY, 0.0),
            timestamp,
            yaw_rad: self.client.get_number(keys::SHOT_YAW, 0.0),
            target_height_m: self.client.get_number(keys::SHOT_TARGET_HEIGHT, 0.0),
            launch_height_m: self.client.get_number(keys::SHOT_LAUNCH_HEIGHT, 0.0),
            parameter_values,
        };

        self.last_shot_timestamp = timestamp;
        info!(
            target: "tuner::bus",
            hit = sample.hit,
            distance = sample.distance_m,
            timestamp,
            "new shot captured"
        );
        Some(sample)
    }

    // ----- one-shot buttons -------------------------------------------------

    /// Read-then-reset button semantics: seeing `true` consumes the press.
    fn take_button(&mut self, key: &str) -> bool {
        if !self.client.is_connected() {
            return false;
        }
        if self.client.get_bool(key, false) {
            if let Err(e) = self.client.put_bool(key, false) {
                warn!(target: "tuner::bus", key, error = %e, "failed to reset button");
            }
            return true;
        }
        false
    }

    pub fn take_run_optimization(&mut self) -> bool {
        self.take_button(keys::RUN_OPTIMIZATION)
    }

    pub fn take_skip_to_next(&mut self) -> bool {
        self.take_button(keys::SKIP_TO_NEXT)
    }

    pub fn take_go_back(&mut self) -> bool {
        self.take_button(keys::GO_BACK)
    }

    pub fn take_reset_session(&mut self) -> bool {
        self.take_button(keys::RESET_SESSION)
    }

    // ----- runtime edits ----------------------------------------------------

    /// Global shot-threshold edit: apply-button pressed yields the new value.
    pub fn read_global_threshold_update(&mut self) -> Option<u32> {
        if !self.take_button(keys::UPDATE_GLOBAL_THRESHOLD) {
            return None;
        }
        let v = self.client.get_number(keys::NEW_GLOBAL_THRESHOLD, 10.0);
        info!(target: "tuner::bus", threshold = v, "global threshold update requested");
        Some(v.max(1.0) as u32)
    }

    /// Local (current parameter only) shot-threshold edit.
    pub fn read_local_threshold_update(&mut self) -> Option<u32> {
        if !self.take_button(keys::UPDATE_LOCAL_THRESHOLD) {
            return None;
        }
        let v = self.client.get_number(keys::NEW_LOCAL_THRESHOLD, 10.0);
        info!(target: "tuner::bus", threshold = v, "local threshold update requested");
        Some(v.max(1.0) as u32)
    }

    /// Manual parameter override request `(name, value)`. Requires the
    /// manual-control enable flag plus the apply button.
    pub fn read_manual_adjustment(&mut self) -> Option<(String, f64)> {
        if !self.client.is_connected() {
            return None;
        }
        if !self.client.get_bool(keys::MANUAL_ENABLED, false) {
            return None;
        }
        if !self.take_button(keys::MANUAL_APPLY) {
            return None;
        }
        let name = self.client.get_string(keys::MANUAL_PARAMETER, "");
        let value = self.client.get_number(keys::MANUAL_VALUE, 0.0);
        info!(target: "tuner::bus", parameter = %name, value, "manual adjustment requested");
        Some((name, value))
    }

    /// Backtrack request: target parameter name, gated on the enable flag
    /// and trigger button.
    pub fn read_backtrack_request(&mut self) -> Option<String> {
        if !self.client.is_connected() {
            return None;
        }
        if !self.client.get_bool(keys::BACKTRACK_ENABLED, false) {
            return None;
        }
        if !self.take_button(keys::BACKTRACK_TRIGGER) {
            return None;
        }
        let name = self.client.get_string(keys::BACKTRACK_TARGET, "");
        info!(target: "tuner::bus", parameter = %name, "backtrack requested");
        Some(name)
    }

    /// Edge-detected runtime enable toggle: `(changed, value)`.
    pub fn read_enabled_toggle(&mut self) -> (bool, bool) {
        if !self.client.is_connected() {
            return (false, true);
        }
        let current = self.client.get_bool(keys::TUNER_ENABLED, true);
        let changed = match self.last_enabled_value {
            Some(last) => last != current,
            None => false,
        };
        self.last_enabled_value = Some(current);
        if changed {
            info!(target: "tuner::bus", enabled = current, "runtime toggle changed");
        }
        (changed, current)
    }

    /// Competition lockout: nonzero field-control word means a match is on.
    pub fn is_match_mode(&self) -> bool {
        self.client.is_connected() && self.client.get_number(keys::MATCH_CONTROL, 0.0) != 0.0
    }

    // ----- dashboard publication --------------------------------------------

    /// Seed the dashboard controls that must exist before anyone can press
    /// them. Existing keys are left alone so operator edits survive.
    pub fn initialize_controls(&mut self, specs: &[ParameterSpec]) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        for key in [
            keys::RUN_OPTIMIZATION,
            keys::SKIP_TO_NEXT,
            keys::GO_BACK,
            keys::RESET_SESSION,
            keys::UPDATE_GLOBAL_THRESHOLD,
            keys::UPDATE_LOCAL_THRESHOLD,
            keys::MANUAL_ENABLED,
            keys::MANUAL_APPLY,
            keys::BACKTRACK_ENABLED,
            keys::BACKTRACK_TRIGGER,
        ] {
            if !self.client.contains_key(key) {
                self.client.put_bool(key, false)?;
            }
        }
        if !self.client.contains_key(keys::TUNER_ENABLED) {
            self.client.put_bool(keys::TUNER_ENABLED, true)?;
        }
        if !self.client.contains_key(keys::NEW_GLOBAL_THRESHOLD) {
            self.client.put_number(keys::NEW_GLOBAL_THRESHOLD, 10.0)?;
        }
        if !self.client.contains_key(keys::NEW_LOCAL_THRESHOLD) {
            self.client.put_number(keys::NEW_LOCAL_THRESHOLD, 10.0)?;
        }
        if !self.client.contains_key(keys::MANUAL_PARAMETER) {
            let first = specs.first().map(|s| s.name.as_str()).unwrap_or("");
            self.client.put_string(keys::MANUAL_PARAMETER, first)?;
        }
        if !self.client.contains_key(keys::MANUAL_VALUE) {
            self.client.put_number(keys::MANUAL_VALUE, 0.0)?;
        }
        if !self.client.contains_key(keys::BACKTRACK_TARGET) {
            self.client.put_string(keys::BACKTRACK_TARGET, "")?;
        }
        let order: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        self.client.put_string(keys::BACKTRACK_ORDER, &order.join(","))?;
        info!(target: "tuner::bus", controls = order.len(), "dashboard controls initialized");
        Ok(())
    }

    /// Human-readable status line for operators.
    pub fn publish_status(&mut self, status: &str) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client.put_string(keys::TUNER_STATUS, status)
    }

    pub fn publish_tuner_state(&mut self, enabled: bool, paused: bool) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        if !self.client.contains_key(keys::TUNER_ENABLED) {
            self.client.put_bool(keys::TUNER_ENABLED, enabled)?;
        }
        self.client.put_bool(keys::TUNER_PAUSED, paused)
    }

    /// Progress counters for the dashboard.
    pub fn publish_autotune_status(
        &mut self,
        autotune_enabled: bool,
        shot_count: usize,
        shot_threshold: u32,
    ) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client.put_bool(keys::AUTOTUNE_ENABLED, autotune_enabled)?;
        self.client.put_number(keys::SHOT_COUNT, shot_count as f64)?;
        self.client.put_number(keys::SHOT_THRESHOLD, f64::from(shot_threshold))
    }

    /// What is being tuned right now and how.
    pub fn publish_current_parameter(
        &mut self,
        name: &str,
        auto_advance: bool,
        step_size: f64,
        iteration: u32,
    ) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client.put_string(keys::CURRENT_PARAMETER, name)?;
        self.client.put_bool(keys::CURRENT_AUTO_ADVANCE, auto_advance)?;
        self.client.put_number(keys::CURRENT_STEP_SIZE, step_size)?;
        self.client.put_number(keys::CURRENT_ITERATION, f64::from(iteration))
    }

    /// Which parameters are already tuned (backtrack candidates).
    pub fn publish_completed(&mut self, tuned: &[String]) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client.put_string(keys::BACKTRACK_TUNED, &tuned.join(","))
    }

    /// Per-parameter live values with their defaults, for monitoring drift.
    pub fn publish_live_values(
        &mut self,
        specs: &[ParameterSpec],
        values: &BTreeMap<String, f64>,
    ) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        for spec in specs {
            let Some(current) = values.get(&spec.name) else { continue };
            let base = format!("{}/{}", keys::LIVE, spec.name);
            self.client.put_number(&format!("{base}/CurrentValue"), *current)?;
            self.client.put_number(&format!("{base}/Default"), spec.default_value)?;
            self.client
                .put_number(&format!("{base}/Difference"), current - spec.default_value)?;
        }
        Ok(())
    }

    /// Interlock requirements the mechanism honors while tuning runs.
    pub fn write_interlock_settings(
        &mut self,
        settings: InterlockSettings,
    ) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client
            .put_bool(keys::INTERLOCK_REQUIRE_LOGGED, settings.require_shot_logged)?;
        self.client
            .put_bool(keys::INTERLOCK_REQUIRE_UPDATED, settings.require_params_updated)?;
        info!(
            target: "tuner::bus",
            shot_logged = settings.require_shot_logged,
            params_updated = settings.require_params_updated,
            "interlock settings written"
        );
        Ok(())
    }

    /// Clear the parameter-update interlock so the mechanism may fire.
    pub fn signal_parameters_updated(&mut self) -> Result<(), TunerError> {
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client.put_bool(keys::INTERLOCK_PARAMS_UPDATED, true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
