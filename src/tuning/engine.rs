//! # Stage: Search Engine
//!
//! Responsibility: the ask/tell seam between the sequential optimizer and
//! whatever actually proposes candidate values.
//!
//! Guarantees:
//! - Suggestions are always within the parameter's `[min, max]` domain and
//!   rounded for integer parameters.
//!
//! NOT Responsible For:
//! - Step decay, scoring, or convergence (optimizer concerns).
//!
//! The built-in [`RandomSearchEngine`] explores uniformly for a fixed number
//! of initial points, then samples a step-sized neighborhood around the best
//! value observed so far. A Gaussian-process engine slots in as another
//! trait impl. [`InertEngine`] is the degraded-mode stub used when no real
//! engine is available.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ParameterSpec;

// ---------------------------------------------------------------------------
// SearchEngine trait
// ---------------------------------------------------------------------------

/// Ask/tell contract for candidate proposal.
pub trait SearchEngine: Send {
    /// Propose the next candidate value. `step` is the optimizer's current
    /// step size and bounds the neighborhood an exploiting engine samples.
    fn suggest(&mut self, step: f64) -> f64;

    /// Feed back the score observed for a candidate. Higher is better.
    fn observe(&mut self, value: f64, score: f64);
}

/// Constructor type the sequencer uses to mint a fresh engine per parameter.
pub type EngineFactory = Box<dyn Fn(&ParameterSpec) -> Box<dyn SearchEngine> + Send>;

// ---------------------------------------------------------------------------
// RandomSearchEngine
// ---------------------------------------------------------------------------

/// Explore-then-exploit random sampler.
pub struct RandomSearchEngine {
    spec: ParameterSpec,
    n_initial: u32,
    asked: u32,
    best: Option<(f64, f64)>, // (value, score)
    rng: StdRng,
}

impl RandomSearchEngine {
    pub fn new(spec: &ParameterSpec, n_initial: u32) -> Self {
        Self {
            spec: spec.clone(),
            n_initial,
            asked: 0,
            best: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for reproducible runs and tests.
    pub fn seeded(spec: &ParameterSpec, n_initial: u32, seed: u64) -> Self {
        Self {
            spec: spec.clone(),
            n_initial,
            asked: 0,
            best: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SearchEngine for RandomSearchEngine {
    fn suggest(&mut self, step: f64) -> f64 {
        self.asked += 1;
        let candidate = match self.best {
            // Exploit: sample the step neighborhood around the best value.
            Some((best_value, _)) if self.asked > self.n_initial => {
                best_value + self.rng.gen_range(-step..=step)
            }
            // Explore: uniform over the whole domain.
            _ => self.rng.gen_range(self.spec.min_value..=self.spec.max_value),
        };
        self.spec.constrain(candidate)
    }

    fn observe(&mut self, value: f64, score: f64) {
        match self.best {
            Some((_, best_score)) if score <= best_score => {}
            _ => self.best = Some((value, score)),
        }
    }
}

// ---------------------------------------------------------------------------
// InertEngine
// ---------------------------------------------------------------------------

/// No-op engine: always suggests the parameter's default and ignores
/// observations. Keeps the loop alive when no real engine is available.
pub struct InertEngine {
    default_value: f64,
}

impl InertEngine {
    pub fn new(spec: &ParameterSpec) -> Self {
        Self { default_value: spec.default_value }
    }
}

impl SearchEngine for InertEngine {
    fn suggest(&mut self, _step: f64) -> f64 {
        self.default_value
    }

    fn observe(&mut self, _value: f64, _score: f64) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ParameterSpec {
        ParameterSpec {
            name: "drag_coefficient".into(),
            default_value: 0.003,
            min_value: 0.001,
            max_value: 0.006,
            initial_step_size: 0.001,
            ..Default::default()
        }
    }

    #[test]
    fn test_suggestions_stay_in_bounds() {
        let s = spec();
        let mut engine = RandomSearchEngine::seeded(&s, 5, 42);
        for _ in 0..50 {
            let v = engine.suggest(0.001);
            assert!(v >= s.min_value && v <= s.max_value, "out of bounds: {v}");
            engine.observe(v, -1.0);
        }
    }

    #[test]
    fn test_integer_spec_suggests_whole_numbers() {
        let s = ParameterSpec {
            name: "iterations".into(),
            default_value: 20.0,
            min_value: 10.0,
            max_value: 30.0,
            initial_step_size: 5.0,
            is_integer: true,
            ..Default::default()
        };
        let mut engine = RandomSearchEngine::seeded(&s, 3, 7);
        for _ in 0..20 {
            let v = engine.suggest(5.0);
            assert_eq!(v, v.round());
        }
    }

    #[test]
    fn test_exploitation_tracks_best_value() {
        let s = spec();
        let mut engine = RandomSearchEngine::seeded(&s, 2, 11);
        engine.suggest(0.001);
        engine.observe(0.004, 1.0);
        engine.suggest(0.001);
        engine.observe(0.002, -1.0);
        // Past the initial points with a tight step, suggestions cluster
        // around the winner.
        for _ in 0..20 {
            let v = engine.suggest(0.0001);
            assert!((v - 0.004).abs() <= 0.0001 + 1e-12, "strayed from best: {v}");
        }
    }

    #[test]
    fn test_observe_keeps_higher_score() {
        let s = spec();
        let mut engine = RandomSearchEngine::seeded(&s, 0, 3);
        engine.observe(0.005, 1.0);
        engine.observe(0.002, -1.0);
        for _ in 0..10 {
            let v = engine.suggest(0.0001);
            assert!((v - 0.005).abs() <= 0.0001 + 1e-12);
        }
    }

    #[test]
    fn test_inert_engine_always_suggests_default() {
        let s = spec();
        let mut engine = InertEngine::new(&s);
        engine.observe(0.006, 1.0);
        assert_eq!(engine.suggest(0.001), 0.003);
        assert_eq!(engine.suggest(0.5), 0.003);
    }
}
