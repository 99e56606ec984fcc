//! # Stage: Tuning Coordinator
//!
//! Responsibility: the control loop. One synchronous [`tick`] per period:
//! drain queued intents, apply the runtime toggle, evaluate safety gates,
//! apply manual overrides and backtracks, ingest shot telemetry, apply
//! threshold edits, evaluate auto-advance and the optimization trigger,
//! drive the sequencer, and publish status.
//!
//! Guarantees:
//! - Sequencer, aggregator, and runtime flags are mutated only from inside
//!   `tick`. External writers (hotkeys, other tasks) enqueue [`Intent`]s on
//!   the single-writer channel and never touch state directly.
//! - A disabled tuner, a disconnected bus, or an active match short-circuits
//!   the tick into a status publish. Nothing is read or written past the
//!   gates.
//! - A run of invalid samples reaching the configured cap halts the session:
//!   the active optimizer is torn down and only an explicit reset resumes.
//!
//! NOT Responsible For:
//! - Candidate generation (engine), scoring/convergence (optimizer), or
//!   transition bookkeeping (sequencer).
//!
//! [`tick`]: TuningCoordinator::tick

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::bus::interface::TunerBus;
use crate::bus::BusClient;
use crate::config::{ParameterSpec, TunerConfig};
use crate::error::TunerError;
use crate::logging::{HistoryEvent, HistoryLog, ShotLog};
use crate::tuning::aggregate::SampleAggregator;
use crate::tuning::engine::SearchEngine;
use crate::tuning::overrides::{resolve_auto_advance, resolve_autotune, EffectiveSettings};
use crate::tuning::sample::ShotSample;
use crate::tuning::sequencer::TuningSequencer;

/// Pause between ticks after a non-transient tick failure.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

type SharedEngineFactory = Arc<dyn Fn(&ParameterSpec) -> Box<dyn SearchEngine> + Send + Sync>;

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// A request queued for the control loop to apply during its own tick.
/// Hotkey handlers and other tasks send these instead of mutating shared
/// state.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Trigger optimization now (manual-mode run button equivalent).
    RunOptimization,
    /// Skip to the next parameter without waiting for convergence.
    SkipToNext,
    /// Step back to the previous parameter.
    GoBack,
    /// Jump to a named parameter.
    Backtrack(String),
    /// Enable or disable the tuner at runtime.
    SetEnabled(bool),
    /// Tear down and restart the tuning session from the first parameter.
    ResetSession,
    /// Stop the run loop.
    Stop,
}

// ---------------------------------------------------------------------------
// TunerStatus
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of the loop, shared behind a mutex for CLI/status
/// consumers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TunerStatus {
    pub enabled: bool,
    pub paused: bool,
    pub connected: bool,
    pub match_mode: bool,
    pub halted: bool,
    pub complete: bool,
    pub current_parameter: Option<String>,
    pub autotune: bool,
    pub shot_count: usize,
    pub shot_threshold: u32,
    pub step_size: f64,
    pub iteration: u32,
    pub completed_parameters: usize,
    pub total_shots: u64,
    pub optimizations: u64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// TuningCoordinator
// ---------------------------------------------------------------------------

pub struct TuningCoordinator<C: BusClient> {
    config: TunerConfig,
    bus: TunerBus<C>,
    sequencer: TuningSequencer,
    aggregator: SampleAggregator,
    engine_factory: SharedEngineFactory,

    intents_tx: mpsc::UnboundedSender<Intent>,
    intents_rx: mpsc::UnboundedReceiver<Intent>,
    status: Arc<Mutex<TunerStatus>>,

    shot_log: Option<ShotLog>,
    history_log: Option<HistoryLog>,

    /// Last value written (or observed) per parameter, seeded from defaults.
    live_values: BTreeMap<String, f64>,

    enabled: bool,
    halted: bool,
    stop_requested: bool,
    consecutive_invalid: u32,
    total_shots: u64,
    optimizations: u64,
}

impl<C: BusClient> TuningCoordinator<C> {
    pub fn new(config: TunerConfig, client: C, engine_factory: SharedEngineFactory) -> Self {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let sequencer = Self::build_sequencer(&config, &engine_factory);
        let live_values = config
            .params
            .iter()
            .map(|p| (p.name.clone(), p.default_value))
            .collect();
        let enabled = config.global.tuner_enabled;
        let bus = TunerBus::new(client, config.bus);

        Self {
            config,
            bus,
            sequencer,
            aggregator: SampleAggregator::new(),
            engine_factory,
            intents_tx,
            intents_rx,
            status: Arc::new(Mutex::new(TunerStatus::default())),
            shot_log: None,
            history_log: None,
            live_values,
            enabled,
            halted: false,
            stop_requested: false,
            consecutive_invalid: 0,
            total_shots: 0,
            optimizations: 0,
        }
    }

    fn build_sequencer(config: &TunerConfig, factory: &SharedEngineFactory) -> TuningSequencer {
        let factory = Arc::clone(factory);
        TuningSequencer::new(
            config.enabled_in_order(),
            config.optimizer,
            Box::new(move |spec| factory(spec)),
        )
    }

    /// Handle for enqueueing intents from other tasks (hotkeys, signal
    /// handlers, tests).
    pub fn intent_sender(&self) -> mpsc::UnboundedSender<Intent> {
        self.intents_tx.clone()
    }

    /// Shared status snapshot, refreshed at the end of every tick.
    pub fn status_handle(&self) -> Arc<Mutex<TunerStatus>> {
        Arc::clone(&self.status)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Attach session data logs under `dir`.
    pub fn attach_logs(&mut self, dir: &Path) -> Result<(), TunerError> {
        self.shot_log = Some(ShotLog::create(dir)?);
        self.history_log = Some(HistoryLog::open(dir)?);
        Ok(())
    }

    /// Connect the bus, seed dashboard controls, write interlock settings,
    /// and record the session start.
    pub fn start(&mut self, server: Option<&str>) -> Result<(), TunerError> {
        match self.bus.connect(server) {
            Ok(()) => info!(target: "tuner::coordinator", "bus connected"),
            // Degraded mode: keep ticking, gates will hold until a reconnect.
            Err(e) if e.is_transient() => {
                warn!(target: "tuner::coordinator", error = %e, "bus unavailable, running degraded")
            }
            Err(e) => return Err(e),
        }
        let specs = self.config.enabled_in_order();
        self.bus.initialize_controls(&specs)?;
        self.bus.write_interlock_settings(self.config.interlock)?;
        self.snapshot(HistoryEvent::SessionStart);
        if let Some(log) = self.shot_log.as_mut() {
            log.log_event("START", "tuning session started")?;
        }
        info!(
            target: "tuner::coordinator",
            parameters = specs.len(),
            "coordinator started"
        );
        Ok(())
    }

    // ----- tick -------------------------------------------------------------

    /// One control-loop iteration. Synchronous and side-effect-complete, so
    /// tests drive it directly.
    pub fn tick(&mut self) -> Result<(), TunerError> {
        // Queued intents first: they are the only path other tasks have into
        // loop state.
        let mut manual_run = false;
        let mut skip = false;
        let mut go_back = false;
        let mut backtrack: Option<String> = None;
        let mut reset = false;
        while let Ok(intent) = self.intents_rx.try_recv() {
            debug!(target: "tuner::coordinator", ?intent, "intent dequeued");
            match intent {
                Intent::RunOptimization => manual_run = true,
                Intent::SkipToNext => skip = true,
                Intent::GoBack => go_back = true,
                Intent::Backtrack(name) => backtrack = Some(name),
                Intent::SetEnabled(v) => self.set_enabled(v),
                Intent::ResetSession => reset = true,
                Intent::Stop => self.stop_requested = true,
            }
        }

        // Runtime toggle, edge-detected off the dashboard.
        let (toggled, toggle_value) = self.bus.read_enabled_toggle();
        if toggled {
            self.set_enabled(toggle_value);
        }
        if self.bus.take_reset_session() {
            reset = true;
        }
        if reset {
            self.reset_session();
        }

        // Safety gates. Each publishes why the loop is idle and stops there.
        if self.halted {
            return self.publish_idle("HALTED (reset session to resume)", false);
        }
        if !self.enabled {
            return self.publish_idle("DISABLED (enable to resume)", false);
        }
        if !self.bus.is_connected() && !self.bus.try_reconnect() {
            return self.publish_idle("WAITING (bus disconnected)", true);
        }
        if self.bus.is_match_mode() {
            return self.publish_idle("PAUSED (match mode)", true);
        }

        // Manual parameter override, bypassing the batch flow.
        if let Some((name, value)) = self.bus.read_manual_adjustment() {
            self.apply_manual_override(&name, value);
        }

        // Backtrack (intent or dashboard).
        if backtrack.is_none() {
            backtrack = self.bus.read_backtrack_request();
        }
        if let Some(name) = backtrack {
            self.apply_backtrack(&name);
        }
        // Consume the button unconditionally: an intent landing in the same
        // tick must not leave the press armed for the next one.
        let go_back_pressed = self.bus.take_go_back();
        if go_back || go_back_pressed {
            if self.sequencer.go_back().is_some() {
                self.aggregator.clear();
            }
        }

        // At most one new shot per tick, rate ceiling permitting.
        let specs = self.config.enabled_in_order();
        if let Some(sample) = self.bus.read_shot(&specs) {
            self.ingest_sample(sample)?;
        }
        if self.halted {
            return self.publish_idle("HALTED (telemetry link broken)", false);
        }

        // Manual skip is only honored where auto-advance is not in effect.
        let (_, eff_aa) = self.effective_for_current();
        if !eff_aa.enabled && self.bus.take_skip_to_next() {
            skip = true;
        }
        if skip {
            info!(target: "tuner::coordinator", "manual skip to next parameter");
            self.aggregator.clear();
            self.sequencer.advance();
        }

        // Runtime threshold edits. Resolved settings below pick these up
        // immediately.
        if let Some(v) = self.bus.read_global_threshold_update() {
            self.config.global.autotune_shot_threshold = v;
            info!(target: "tuner::coordinator", threshold = v, "global threshold updated");
        }
        if let Some(v) = self.bus.read_local_threshold_update() {
            self.apply_local_threshold(v);
        }

        let (eff_autotune, eff_advance) = self.effective_for_current();

        // Auto-advance: independent of autotune, demands a full hit streak
        // at its own threshold.
        if eff_advance.enabled
            && self.aggregator.len() >= eff_advance.shot_threshold as usize
            && self.aggregator.all_hits()
        {
            info!(
                target: "tuner::coordinator",
                shots = self.aggregator.len(),
                "auto-advance: full hit streak"
            );
            self.aggregator.clear();
            self.sequencer.advance();
            self.snapshot(HistoryEvent::AutoAdvance);
        }

        // Optimization trigger: threshold in autotune mode, explicit request
        // in manual mode.
        if !eff_autotune.enabled && self.bus.take_run_optimization() {
            manual_run = true;
        }
        let threshold_met = eff_autotune.enabled
            && self.aggregator.len() >= eff_autotune.shot_threshold as usize;
        if (threshold_met || manual_run) && !self.aggregator.is_empty() {
            self.run_optimization()?;
        }

        self.publish_status(eff_autotune, eff_advance)
    }

    // ----- tick helpers -----------------------------------------------------

    /// Effective settings for whatever parameter is active, re-resolved from
    /// the live config (runtime edits land there).
    fn effective_for_current(&self) -> (EffectiveSettings, EffectiveSettings) {
        let global = &self.config.global;
        let (autotune, advance) = self
            .sequencer
            .current_parameter()
            .and_then(|p| self.config.param(&p.name))
            .map(|p| (p.autotune, p.auto_advance))
            .unwrap_or_default();
        (
            resolve_autotune(global, &autotune),
            resolve_auto_advance(global, &advance),
        )
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        info!(target: "tuner::coordinator", enabled, "runtime enable changed");
        self.snapshot(if enabled { HistoryEvent::Enabled } else { HistoryEvent::Disabled });
    }

    /// Fresh session: new sequencer over the (possibly edited) config,
    /// cleared buffers and counters.
    fn reset_session(&mut self) {
        self.sequencer = Self::build_sequencer(&self.config, &self.engine_factory);
        self.aggregator.clear();
        self.consecutive_invalid = 0;
        self.halted = false;
        info!(target: "tuner::coordinator", "session reset");
        self.snapshot(HistoryEvent::SessionStart);
    }

    /// Validated, clamped, force-written value change from the dashboard.
    /// Clears the pending buffer so stale-value samples cannot leak into the
    /// next flush.
    fn apply_manual_override(&mut self, name: &str, value: f64) {
        let Some(spec) = self.config.param(name).cloned() else {
            warn!(
                target: "tuner::coordinator",
                parameter = name,
                "manual override for unknown parameter rejected"
            );
            return;
        };
        let applied = spec.constrain(value);
        if applied != value {
            warn!(
                target: "tuner::coordinator",
                parameter = name,
                requested = value,
                applied,
                "manual override clamped to bounds"
            );
        }
        match self.bus.write_parameter(&spec.bus_key, applied, true) {
            Ok(_) => {
                self.live_values.insert(spec.name.clone(), applied);
                self.aggregator.clear();
                info!(
                    target: "tuner::coordinator",
                    parameter = name,
                    value = applied,
                    "manual override applied, sample buffer cleared"
                );
                self.snapshot(HistoryEvent::ManualChange);
            }
            Err(e) => warn!(
                target: "tuner::coordinator",
                parameter = name,
                error = %e,
                "manual override write failed"
            ),
        }
    }

    fn apply_backtrack(&mut self, name: &str) {
        match self.sequencer.backtrack_to(name) {
            Ok(()) => {
                self.aggregator.clear();
                self.snapshot(HistoryEvent::Backtrack);
            }
            Err(e) => warn!(
                target: "tuner::coordinator",
                parameter = name,
                error = %e,
                "backtrack rejected"
            ),
        }
    }

    /// Local threshold edit targets the current parameter and switches its
    /// local autotune override on so the edit actually takes effect.
    fn apply_local_threshold(&mut self, threshold: u32) {
        let Some(name) = self.sequencer.current_parameter().map(|p| p.name.clone()) else {
            return;
        };
        let effective_enabled = self.effective_for_current().0.enabled;
        if let Some(spec) = self.config.param_mut(&name) {
            spec.autotune.shot_threshold = threshold;
            if !spec.autotune.active {
                spec.autotune.active = true;
                spec.autotune.enabled = effective_enabled;
            }
            info!(
                target: "tuner::coordinator",
                parameter = %name,
                threshold,
                "local threshold updated, override enabled"
            );
        }
    }

    fn ingest_sample(&mut self, sample: ShotSample) -> Result<(), TunerError> {
        if let Err(e) = sample.validate(&self.config.physical) {
            self.consecutive_invalid += 1;
            warn!(
                target: "tuner::coordinator",
                error = %e,
                consecutive = self.consecutive_invalid,
                cap = self.config.max_consecutive_invalid,
                "invalid shot sample discarded"
            );
            if self.consecutive_invalid >= self.config.max_consecutive_invalid {
                self.halt_session()?;
            }
            return Ok(());
        }
        self.consecutive_invalid = 0;
        self.total_shots += 1;

        let Some(current) = self.sequencer.current_parameter().map(|p| p.name.clone()) else {
            debug!(target: "tuner::coordinator", "shot received with no active parameter");
            return Ok(());
        };
        // Prefer the value the mechanism reports it actually used.
        let value = sample
            .parameter_values
            .get(&current)
            .copied()
            .or_else(|| self.live_values.get(&current).copied())
            .unwrap_or_default();

        if let Some(log) = self.shot_log.as_mut() {
            let (step, iteration) = self
                .sequencer
                .active_optimizer()
                .map(|o| (o.current_step(), o.iteration()))
                .unwrap_or((0.0, 0));
            log.log_shot(
                &current,
                value,
                step,
                iteration,
                &sample,
                true,
                false,
                "ACTIVE",
                &self.live_values,
            )?;
        }
        self.aggregator.push(sample, value);
        Ok(())
    }

    /// Repeated invalid telemetry means the sensor link is broken, not
    /// noise. Tear the optimizer down and stop until an explicit reset.
    fn halt_session(&mut self) -> Result<(), TunerError> {
        error!(
            target: "tuner::coordinator",
            invalid = self.consecutive_invalid,
            "consecutive invalid samples reached cap, halting session"
        );
        self.sequencer.halt();
        self.aggregator.clear();
        self.halted = true;
        self.snapshot(HistoryEvent::SessionHalt);
        if let Some(log) = self.shot_log.as_mut() {
            log.log_event("HALT", "telemetry link presumed broken")?;
        }
        Ok(())
    }

    /// Flush the aggregator into the active optimizer, push the next
    /// candidate to the bus, and advance on convergence.
    fn run_optimization(&mut self) -> Result<(), TunerError> {
        let Some(obs) = self.aggregator.flush() else {
            return Ok(());
        };
        let Some(opt) = self.sequencer.active_optimizer_mut() else {
            debug!(target: "tuner::coordinator", "optimization requested after completion");
            return Ok(());
        };
        info!(
            target: "tuner::coordinator",
            parameter = opt.parameter_name(),
            batch = obs.batch_size,
            hit = obs.hit,
            hit_rate = obs.hit_rate,
            avg_value = obs.avg_value,
            "running optimization"
        );
        opt.report(&obs)?;
        self.optimizations += 1;

        if opt.is_converged() {
            // Pin the winner before leaving the parameter.
            let (name, bus_key, best) = (
                opt.parameter_name().to_string(),
                opt.spec().bus_key.clone(),
                opt.recommended_value(),
            );
            self.bus.write_parameter(&bus_key, best, true)?;
            self.live_values.insert(name, best);
            self.sequencer.advance();
        }

        // Next candidate, from whichever optimizer is now active.
        if let Some(opt) = self.sequencer.active_optimizer_mut() {
            if !opt.is_converged() {
                let candidate = opt.suggest()?;
                let (name, bus_key) =
                    (opt.parameter_name().to_string(), opt.spec().bus_key.clone());
                self.bus.write_parameter(&bus_key, candidate, false)?;
                self.live_values.insert(name, candidate);
            }
        }
        self.bus.signal_parameters_updated()?;
        self.snapshot(HistoryEvent::Optimization);
        Ok(())
    }

    // ----- status publication -----------------------------------------------

    /// Gate short-circuit path: record why the loop is idle and publish it.
    fn publish_idle(&mut self, message: &str, paused: bool) -> Result<(), TunerError> {
        self.update_status_snapshot(None, None, message, paused);
        self.bus.publish_tuner_state(self.enabled, paused)?;
        self.bus.publish_status(message)?;
        Ok(())
    }

    fn publish_status(
        &mut self,
        eff_autotune: EffectiveSettings,
        eff_advance: EffectiveSettings,
    ) -> Result<(), TunerError> {
        let message = match self.sequencer.current_parameter() {
            Some(p) => {
                let mode = if eff_autotune.enabled { "autotune" } else { "manual" };
                format!(
                    "ACTIVE: {} ({mode}, {}/{} shots)",
                    p.name,
                    self.aggregator.len(),
                    eff_autotune.shot_threshold
                )
            }
            None if self.sequencer.is_complete() => "COMPLETE: all parameters tuned".to_string(),
            None => "IDLE".to_string(),
        };
        self.update_status_snapshot(Some(eff_autotune), Some(eff_advance), &message, false);

        self.bus.publish_tuner_state(self.enabled, false)?;
        self.bus.publish_status(&message)?;
        self.bus.publish_autotune_status(
            eff_autotune.enabled,
            self.aggregator.len(),
            eff_autotune.shot_threshold,
        )?;
        if let Some(opt) = self.sequencer.active_optimizer() {
            let name = opt.parameter_name().to_string();
            let (step, iteration) = (opt.current_step(), opt.iteration());
            self.bus
                .publish_current_parameter(&name, eff_advance.enabled, step, iteration)?;
        }
        let tuned: Vec<String> =
            self.sequencer.completed().iter().map(|c| c.parameter.clone()).collect();
        self.bus.publish_completed(&tuned)?;
        let specs = self.config.enabled_in_order();
        self.bus.publish_live_values(&specs, &self.live_values)?;
        self.bus.flush_pending()?;
        Ok(())
    }

    fn update_status_snapshot(
        &self,
        eff_autotune: Option<EffectiveSettings>,
        _eff_advance: Option<EffectiveSettings>,
        message: &str,
        paused: bool,
    ) {
        let Ok(mut status) = self.status.lock() else { return };
        status.enabled = self.enabled;
        status.paused = paused;
        status.connected = self.bus.is_connected();
        status.match_mode = self.bus.is_match_mode();
        status.halted = self.halted;
        status.complete = self.sequencer.is_complete();
        status.current_parameter =
            self.sequencer.current_parameter().map(|p| p.name.clone());
        status.autotune = eff_autotune.map(|e| e.enabled).unwrap_or(false);
        status.shot_count = self.aggregator.len();
        status.shot_threshold = eff_autotune.map(|e| e.shot_threshold).unwrap_or(0);
        if let Some(opt) = self.sequencer.active_optimizer() {
            status.step_size = opt.current_step();
            status.iteration = opt.iteration();
        }
        status.completed_parameters = self.sequencer.completed().len();
        status.total_shots = self.total_shots;
        status.optimizations = self.optimizations;
        status.message = message.to_string();
    }

    // ----- run loop ---------------------------------------------------------

    /// Drive `tick` at the configured rate until a shutdown signal or a
    /// `Stop` intent arrives, then tear down.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs_f64(1.0 / self.config.tick_hz);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            target: "tuner::coordinator",
            tick_hz = self.config.tick_hz,
            "control loop running"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(target: "tuner::coordinator", "shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        // The loop never dies on a single tick. Transient
                        // errors already degraded to no-ops inside; anything
                        // surfacing here gets logged and a short backoff.
                        error!(target: "tuner::coordinator", error = %e, "tick failed");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                    if self.stop_requested {
                        info!(target: "tuner::coordinator", "stop requested");
                        break;
                    }
                }
            }
        }
        self.teardown();
    }

    /// Flush logs and release the bus. Failures here are logged, never
    /// propagated: teardown runs on every exit path.
    fn teardown(&mut self) {
        if let Err(e) = self.bus.publish_status("STOPPED") {
            warn!(target: "tuner::coordinator", error = %e, "final status publish failed");
        }
        if let Err(e) = self.bus.flush_pending() {
            warn!(target: "tuner::coordinator", error = %e, "final write flush failed");
        }
        if let Some(log) = self.shot_log.as_mut() {
            if let Err(e) = log.log_event("STOP", "tuning session ended") {
                warn!(target: "tuner::coordinator", error = %e, "final log event failed");
            }
            if let Err(e) = log.flush() {
                warn!(target: "tuner::coordinator", error = %e, "shot log flush failed");
            }
        }
        self.bus.disconnect();
        info!(target: "tuner::coordinator", "coordinator stopped");
    }

    /// Full-parameter-set history snapshot; absent or failing logs are not
    /// fatal to the loop.
    fn snapshot(&mut self, event: HistoryEvent) {
        if let Some(log) = self.history_log.as_mut() {
            if let Err(e) = log.log_snapshot(event, &self.live_values) {
                warn!(target: "tuner::coordinator", error = %e, "history snapshot failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
