//! # Stage: Sequential Optimizer
//!
//! Responsibility: drive one search-engine instance for one parameter —
//! scoring, step-size decay, best-value tracking, and convergence detection.
//!
//! Guarantees:
//! - Suggestions are clamped to the parameter domain by the engine seam.
//! - Once converged the optimizer is terminal: further `suggest`/`report`
//!   calls fail instead of mutating state.
//!
//! NOT Responsible For:
//! - Deciding when a batch is ready (coordinator) or which parameter is
//!   active (sequencer).

use tracing::{debug, info};

use crate::config::{OptimizerSettings, ParameterSpec};
use crate::error::TunerError;
use crate::tuning::aggregate::AggregatedObservation;
use crate::tuning::engine::SearchEngine;

/// Scores last-5 window below this variance count as a plateau.
const SCORE_VARIANCE_THRESHOLD: f64 = 0.01;

/// Weight of the distance-based secondary score adjustment.
const DISTANCE_PENALTY_SCALE: f64 = 0.01;

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// One completed ask/tell cycle, kept for history logging.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: f64,
    pub hit: bool,
    pub score: f64,
    pub step_size: f64,
}

// ---------------------------------------------------------------------------
// SequentialOptimizer
// ---------------------------------------------------------------------------

/// Optimization run for a single parameter. Created fresh on every entry to
/// a parameter; never resumed.
pub struct SequentialOptimizer {
    spec: ParameterSpec,
    settings: OptimizerSettings,
    engine: Box<dyn SearchEngine>,
    iteration: u32,
    current_step: f64,
    best: Option<(f64, f64)>, // (value, score)
    history: Vec<Evaluation>,
    converged: bool,
}

impl SequentialOptimizer {
    pub fn new(
        spec: ParameterSpec,
        settings: OptimizerSettings,
        engine: Box<dyn SearchEngine>,
    ) -> Self {
        let current_step = spec.initial_step_size;
        Self {
            spec,
            settings,
            engine,
            iteration: 0,
            current_step,
            best: None,
            history: Vec::new(),
            converged: false,
        }
    }

    pub fn parameter_name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ParameterSpec {
        &self.spec
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn current_step(&self) -> f64 {
        self.current_step
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Best `(value, score)` seen so far.
    pub fn best(&self) -> Option<(f64, f64)> {
        self.best
    }

    pub fn history(&self) -> &[Evaluation] {
        &self.history
    }

    /// The value the mechanism should use right now: best so far, or the
    /// configured default before any evaluation lands.
    pub fn recommended_value(&self) -> f64 {
        self.best.map(|(v, _)| v).unwrap_or(self.spec.default_value)
    }

    /// Ask the engine for the next candidate.
    pub fn suggest(&mut self) -> Result<f64, TunerError> {
        if self.converged {
            return Err(TunerError::OptimizerConverged(self.spec.name.clone()));
        }
        let candidate = self.engine.suggest(self.current_step);
        debug!(
            target: "tuner::optimizer",
            parameter = %self.spec.name,
            candidate,
            step = self.current_step,
            iteration = self.iteration,
            "suggested candidate"
        );
        Ok(candidate)
    }

    /// Report one aggregated observation back to the engine.
    pub fn report(&mut self, obs: &AggregatedObservation) -> Result<(), TunerError> {
        if self.converged {
            return Err(TunerError::OptimizerConverged(self.spec.name.clone()));
        }

        let score = score_observation(obs);
        self.engine.observe(obs.avg_value, score);

        match self.best {
            Some((_, best_score)) if score <= best_score => {}
            _ => self.best = Some((obs.avg_value, score)),
        }

        self.history.push(Evaluation {
            value: obs.avg_value,
            hit: obs.hit,
            score,
            step_size: self.current_step,
        });

        self.iteration += 1;
        self.current_step = self.decayed_step();

        if self.convergence_reached() {
            self.converged = true;
            info!(
                target: "tuner::optimizer",
                parameter = %self.spec.name,
                iterations = self.iteration,
                best_value = self.best.map(|(v, _)| v),
                "optimizer converged"
            );
        }
        Ok(())
    }

    fn step_floor(&self) -> f64 {
        self.spec.initial_step_size * self.settings.min_step_ratio
    }

    fn decayed_step(&self) -> f64 {
        let decayed =
            self.spec.initial_step_size * self.spec.step_decay_rate.powi(self.iteration as i32);
        decayed.max(self.step_floor())
    }

    fn convergence_reached(&self) -> bool {
        if self.iteration >= self.settings.calls_per_parameter {
            return true;
        }
        // Step has decayed to within 10% of its floor.
        if self.current_step <= self.step_floor() * 1.1 {
            return true;
        }
        // Score plateau over the last five reports.
        if self.history.len() >= 5 {
            let recent: Vec<f64> =
                self.history[self.history.len() - 5..].iter().map(|e| e.score).collect();
            if variance(&recent) < SCORE_VARIANCE_THRESHOLD {
                return true;
            }
        }
        false
    }
}

/// Score an aggregated observation: hit/miss dominates, with a small
/// distance-weighted secondary adjustment.
fn score_observation(obs: &AggregatedObservation) -> f64 {
    let base = if obs.hit { 1.0 } else { -1.0 };
    if obs.avg_distance > 0.0 {
        base - DISTANCE_PENALTY_SCALE / obs.avg_distance.max(1.0)
    } else {
        base
    }
}

fn variance(xs: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::engine::RandomSearchEngine;

    fn spec() -> ParameterSpec {
        ParameterSpec {
            name: "drag_coefficient".into(),
            default_value: 0.003,
            min_value: 0.001,
            max_value: 0.006,
            initial_step_size: 0.001,
            step_decay_rate: 0.9,
            ..Default::default()
        }
    }

    fn optimizer(settings: OptimizerSettings) -> SequentialOptimizer {
        let s = spec();
        let engine = Box::new(RandomSearchEngine::seeded(&s, settings.n_initial_points, 42));
        SequentialOptimizer::new(s, settings, engine)
    }

    fn obs(value: f64, hit: bool, distance: f64) -> AggregatedObservation {
        AggregatedObservation {
            avg_value: value,
            hit,
            avg_distance: distance,
            batch_size: 3,
            hit_rate: if hit { 1.0 } else { 0.0 },
        }
    }

    // ===== Scoring =====

    #[test]
    fn test_hit_scores_positive_miss_negative() {
        assert!(score_observation(&obs(0.003, true, 4.0)) > 0.9);
        assert!(score_observation(&obs(0.003, false, 4.0)) < -0.9);
    }

    #[test]
    fn test_distance_penalty_shrinks_with_distance() {
        let near = score_observation(&obs(0.003, false, 2.0));
        let far = score_observation(&obs(0.003, false, 8.0));
        assert!(near < far); // penalty shrinks with distance
    }

    #[test]
    fn test_zero_distance_skips_adjustment() {
        assert_eq!(score_observation(&obs(0.003, true, 0.0)), 1.0);
    }

    #[test]
    fn test_sub_meter_distance_clamped_in_penalty() {
        // max(distance, 1.0) keeps the penalty bounded at the scale constant
        let s = score_observation(&obs(0.003, false, 0.2));
        assert!((s - (-1.0 - DISTANCE_PENALTY_SCALE)).abs() < 1e-12);
    }

    // ===== Step decay =====

    #[test]
    fn test_step_decays_geometrically_to_floor() {
        let settings = OptimizerSettings {
            calls_per_parameter: 100,
            min_step_ratio: 0.1,
            ..Default::default()
        };
        let mut opt = optimizer(settings);
        let initial = opt.current_step();

        // Alternate hit/miss at spread distances so variance stays high and
        // only the decay path can converge.
        for i in 0..3 {
            opt.report(&obs(0.003, i % 2 == 0, 2.0 + i as f64)).unwrap();
        }
        let expected = (initial * 0.9f64.powi(3)).max(initial * 0.1);
        assert!((opt.current_step() - expected).abs() < 1e-15);
    }

    #[test]
    fn test_step_never_below_floor() {
        let settings = OptimizerSettings {
            calls_per_parameter: 500,
            min_step_ratio: 0.5,
            ..Default::default()
        };
        let mut opt = optimizer(settings);
        for i in 0..4 {
            opt.report(&obs(0.003, i % 2 == 0, 2.0 + i as f64)).unwrap();
        }
        assert!(opt.current_step() >= 0.001 * 0.5 - 1e-15);
    }

    // ===== Convergence =====

    #[test]
    fn test_converges_at_iteration_cap_despite_high_variance() {
        let settings = OptimizerSettings {
            calls_per_parameter: 4,
            min_step_ratio: 0.0001, // decay path unreachable in 4 iters
            ..Default::default()
        };
        let mut opt = optimizer(settings);
        for i in 0..4 {
            assert!(!opt.is_converged());
            opt.report(&obs(0.003, i % 2 == 0, 2.0 + i as f64)).unwrap();
        }
        assert!(opt.is_converged());
        assert_eq!(opt.iteration(), 4);
    }

    #[test]
    fn test_converges_on_score_plateau() {
        let settings = OptimizerSettings {
            calls_per_parameter: 100,
            min_step_ratio: 0.0001,
            ..Default::default()
        };
        let mut opt = optimizer(settings);
        // Identical scores -> zero variance once 5 reports land.
        for _ in 0..5 {
            opt.report(&obs(0.003, true, 4.0)).unwrap();
        }
        assert!(opt.is_converged());
    }

    #[test]
    fn test_converges_when_step_reaches_floor() {
        let settings = OptimizerSettings {
            calls_per_parameter: 1000,
            min_step_ratio: 0.9, // floor within one decay step
            ..Default::default()
        };
        let mut opt = optimizer(settings);
        opt.report(&obs(0.003, true, 4.0)).unwrap();
        assert!(opt.is_converged());
    }

    // ===== Terminal behavior =====

    #[test]
    fn test_converged_optimizer_rejects_suggest_and_report() {
        let settings =
            OptimizerSettings { calls_per_parameter: 1, ..Default::default() };
        let mut opt = optimizer(settings);
        opt.report(&obs(0.003, true, 4.0)).unwrap();
        assert!(opt.is_converged());

        assert!(matches!(opt.suggest(), Err(TunerError::OptimizerConverged(_))));
        assert!(matches!(
            opt.report(&obs(0.003, true, 4.0)),
            Err(TunerError::OptimizerConverged(_))
        ));
        assert_eq!(opt.iteration(), 1);
    }

    // ===== Best tracking / history =====

    #[test]
    fn test_best_value_tracks_highest_score() {
        let settings = OptimizerSettings {
            calls_per_parameter: 100,
            min_step_ratio: 0.0001,
            ..Default::default()
        };
        let mut opt = optimizer(settings);
        opt.report(&obs(0.002, false, 4.0)).unwrap();
        opt.report(&obs(0.004, true, 4.0)).unwrap();
        opt.report(&obs(0.005, false, 4.0)).unwrap();
        let (value, score) = opt.best().unwrap();
        assert_eq!(value, 0.004);
        assert!(score > 0.9);
        assert_eq!(opt.recommended_value(), 0.004);
    }

    #[test]
    fn test_recommended_value_defaults_before_first_report() {
        let opt = optimizer(OptimizerSettings::default());
        assert_eq!(opt.recommended_value(), 0.003);
    }

    #[test]
    fn test_history_records_every_report_in_order() {
        let settings = OptimizerSettings {
            calls_per_parameter: 100,
            min_step_ratio: 0.0001,
            ..Default::default()
        };
        let mut opt = optimizer(settings);
        opt.report(&obs(0.002, false, 4.0)).unwrap();
        opt.report(&obs(0.004, true, 4.0)).unwrap();
        let hist = opt.history();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].value, 0.002);
        assert!(!hist[0].hit);
        assert_eq!(hist[1].value, 0.004);
        assert!(hist[1].hit);
        assert_eq!(hist[0].step_size, 0.001); // step recorded before decay
    }
}
