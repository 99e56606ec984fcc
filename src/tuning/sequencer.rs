//! # Stage: Tuning Sequencer
//!
//! Responsibility: own the ordered enabled-parameter list, the cursor, and
//! the single active optimizer; perform advance / go-back / backtrack
//! transitions.
//!
//! Guarantees:
//! - Exactly one optimizer is active at a time (or none, when complete or
//!   halted).
//! - Every entry into a parameter mints a fresh optimizer — prior history
//!   for that parameter is archived or discarded, never resumed.
//! - A backtrack to an unknown name fails without mutating anything.
//!
//! NOT Responsible For:
//! - When transitions fire (coordinator) or what candidates look like
//!   (engine).

use tracing::{info, warn};

use crate::config::{OptimizerSettings, ParameterSpec};
use crate::error::TunerError;
use crate::tuning::engine::EngineFactory;
use crate::tuning::optimizer::SequentialOptimizer;

// ---------------------------------------------------------------------------
// CompletedRun
// ---------------------------------------------------------------------------

/// Archived summary of a finished (or abandoned) optimizer run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRun {
    pub parameter: String,
    pub iterations: u32,
    pub best_value: f64,
    pub best_score: Option<f64>,
    /// Fraction of reported batches that scored as hits.
    pub hit_rate: f64,
    pub converged: bool,
}

impl CompletedRun {
    fn from_optimizer(opt: &SequentialOptimizer) -> Self {
        let history = opt.history();
        let hit_rate = if history.is_empty() {
            0.0
        } else {
            history.iter().filter(|e| e.hit).count() as f64 / history.len() as f64
        };
        Self {
            parameter: opt.parameter_name().to_string(),
            iterations: opt.iteration(),
            best_value: opt.recommended_value(),
            best_score: opt.best().map(|(_, s)| s),
            hit_rate,
            converged: opt.is_converged(),
        }
    }
}

// ---------------------------------------------------------------------------
// TuningSequencer
// ---------------------------------------------------------------------------

/// Cursor over the enabled parameters, driving one optimizer at a time.
pub struct TuningSequencer {
    params: Vec<ParameterSpec>,
    settings: OptimizerSettings,
    engine_factory: EngineFactory,
    cursor: usize,
    active: Option<SequentialOptimizer>,
    completed: Vec<CompletedRun>,
    halted: bool,
}

impl TuningSequencer {
    /// Build a sequencer over `params` (already filtered to enabled, in
    /// tuning order) and activate the first one.
    pub fn new(
        params: Vec<ParameterSpec>,
        settings: OptimizerSettings,
        engine_factory: EngineFactory,
    ) -> Self {
        let mut seq = Self {
            params,
            settings,
            engine_factory,
            cursor: 0,
            active: None,
            completed: Vec::new(),
            halted: false,
        };
        seq.activate_cursor();
        seq
    }

    fn activate_cursor(&mut self) {
        self.active = self.params.get(self.cursor).map(|spec| {
            info!(
                target: "tuner::sequencer",
                parameter = %spec.name,
                position = self.cursor + 1,
                total = self.params.len(),
                "starting parameter"
            );
            let engine = (self.engine_factory)(spec);
            SequentialOptimizer::new(spec.clone(), self.settings, engine)
        });
    }

    pub fn active_optimizer(&self) -> Option<&SequentialOptimizer> {
        self.active.as_ref()
    }

    pub fn active_optimizer_mut(&mut self) -> Option<&mut SequentialOptimizer> {
        self.active.as_mut()
    }

    pub fn current_parameter(&self) -> Option<&ParameterSpec> {
        self.active.as_ref().map(|o| o.spec())
    }

    pub fn completed(&self) -> &[CompletedRun] {
        &self.completed
    }

    /// All enabled parameters have been tuned and nothing is active.
    pub fn is_complete(&self) -> bool {
        !self.halted && self.active.is_none() && self.cursor >= self.params.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Archive the active optimizer and move to the next parameter. No-op
    /// past the end of the sequence. Returns the newly active parameter
    /// name, or `None` when the sequence just finished (or already had).
    pub fn advance(&mut self) -> Option<&str> {
        if self.halted {
            return None;
        }
        if let Some(opt) = self.active.take() {
            self.completed.push(CompletedRun::from_optimizer(&opt));
        } else if self.cursor >= self.params.len() {
            info!(target: "tuner::sequencer", "sequence already complete, advance ignored");
            return None;
        }
        self.cursor += 1;
        self.activate_cursor();
        if self.active.is_none() {
            info!(
                target: "tuner::sequencer",
                tuned = self.completed.len(),
                "all parameters tuned"
            );
        }
        self.current_parameter().map(|p| p.name.as_str())
    }

    /// Move the cursor back one position with a fresh optimizer. No-op at
    /// position zero.
    pub fn go_back(&mut self) -> Option<&str> {
        if self.halted {
            return None;
        }
        if self.cursor == 0 {
            warn!(target: "tuner::sequencer", "go-back ignored at first parameter");
            return None;
        }
        if let Some(opt) = self.active.take() {
            self.completed.push(CompletedRun::from_optimizer(&opt));
        }
        self.cursor -= 1;
        self.activate_cursor();
        self.current_parameter().map(|p| p.name.as_str())
    }

    /// Jump the cursor to a named parameter with a fresh optimizer. Fails
    /// without mutation when the name is not in the active order.
    pub fn backtrack_to(&mut self, name: &str) -> Result<(), TunerError> {
        if self.halted {
            return Err(TunerError::SessionHalted("sequencer halted".into()));
        }
        let index = self
            .params
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| TunerError::UnknownParameter(name.to_string()))?;

        if let Some(opt) = self.active.take() {
            self.completed.push(CompletedRun::from_optimizer(&opt));
        }
        self.cursor = index;
        self.activate_cursor();
        info!(target: "tuner::sequencer", parameter = name, "backtracked");
        Ok(())
    }

    /// Tear down the active optimizer. Used when the session goes fatal;
    /// only a full reset resumes tuning.
    pub fn halt(&mut self) {
        self.active = None;
        self.halted = true;
        warn!(target: "tuner::sequencer", "sequencer halted");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::engine::RandomSearchEngine;
    use crate::tuning::aggregate::AggregatedObservation;

    fn spec(name: &str) -> ParameterSpec {
        ParameterSpec {
            name: name.into(),
            default_value: 0.5,
            min_value: 0.0,
            max_value: 1.0,
            initial_step_size: 0.1,
            bus_key: name.into(),
            ..Default::default()
        }
    }

    fn sequencer(names: &[&str]) -> TuningSequencer {
        let params = names.iter().map(|n| spec(n)).collect();
        let settings = OptimizerSettings::default();
        TuningSequencer::new(
            params,
            settings,
            Box::new(move |s| Box::new(RandomSearchEngine::seeded(s, 5, 1))),
        )
    }

    fn obs(value: f64) -> AggregatedObservation {
        AggregatedObservation {
            avg_value: value,
            hit: true,
            avg_distance: 4.0,
            batch_size: 3,
            hit_rate: 1.0,
        }
    }

    fn miss(value: f64) -> AggregatedObservation {
        AggregatedObservation { hit: false, hit_rate: 0.0, ..obs(value) }
    }

    // ===== Construction =====

    #[test]
    fn test_first_parameter_active_on_construction() {
        let seq = sequencer(&["a", "b", "c"]);
        assert_eq!(seq.current_parameter().unwrap().name, "a");
        assert!(!seq.is_complete());
    }

    #[test]
    fn test_empty_parameter_list_is_immediately_complete() {
        let seq = sequencer(&[]);
        assert!(seq.active_optimizer().is_none());
        assert!(seq.is_complete());
    }

    // ===== advance =====

    #[test]
    fn test_advance_archives_and_moves_forward() {
        let mut seq = sequencer(&["a", "b"]);
        seq.active_optimizer_mut().unwrap().report(&obs(0.4)).unwrap();
        seq.active_optimizer_mut().unwrap().report(&miss(0.6)).unwrap();
        assert_eq!(seq.advance(), Some("b"));
        assert_eq!(seq.completed().len(), 1);
        let run = &seq.completed()[0];
        assert_eq!(run.parameter, "a");
        assert_eq!(run.iterations, 2);
        assert_eq!(run.hit_rate, 0.5); // one hit, one miss across the batches
        assert!(!run.converged);
    }

    #[test]
    fn test_advance_past_last_parameter_completes() {
        let mut seq = sequencer(&["a"]);
        assert_eq!(seq.advance(), None);
        assert!(seq.is_complete());
        assert_eq!(seq.completed().len(), 1);
    }

    #[test]
    fn test_advance_after_complete_is_noop() {
        let mut seq = sequencer(&["a"]);
        seq.advance();
        assert_eq!(seq.advance(), None);
        assert_eq!(seq.completed().len(), 1); // nothing double-archived
        assert!(seq.is_complete());
    }

    #[test]
    fn test_reentry_starts_fresh_optimizer() {
        let mut seq = sequencer(&["a", "b"]);
        seq.active_optimizer_mut().unwrap().report(&obs(0.4)).unwrap();
        seq.advance();
        seq.go_back();
        let opt = seq.active_optimizer().unwrap();
        assert_eq!(opt.parameter_name(), "a");
        assert_eq!(opt.iteration(), 0);
        assert!(opt.history().is_empty());
    }

    // ===== go_back =====

    #[test]
    fn test_go_back_at_first_parameter_is_noop() {
        let mut seq = sequencer(&["a", "b"]);
        assert_eq!(seq.go_back(), None);
        assert_eq!(seq.current_parameter().unwrap().name, "a");
        assert!(seq.completed().is_empty());
    }

    #[test]
    fn test_go_back_moves_one_position() {
        let mut seq = sequencer(&["a", "b", "c"]);
        seq.advance();
        seq.advance();
        assert_eq!(seq.go_back(), Some("b"));
    }

    // ===== backtrack_to =====

    #[test]
    fn test_backtrack_to_named_parameter() {
        let mut seq = sequencer(&["a", "b", "c"]);
        seq.advance();
        seq.advance();
        seq.active_optimizer_mut().unwrap().report(&obs(0.4)).unwrap();
        seq.backtrack_to("a").unwrap();
        let opt = seq.active_optimizer().unwrap();
        assert_eq!(opt.parameter_name(), "a");
        assert_eq!(opt.iteration(), 0);
        assert!(opt.history().is_empty());
    }

    #[test]
    fn test_backtrack_to_unknown_name_rejected_without_mutation() {
        let mut seq = sequencer(&["a", "b"]);
        seq.advance();
        let err = seq.backtrack_to("nope").unwrap_err();
        assert!(matches!(err, TunerError::UnknownParameter(_)));
        assert_eq!(seq.current_parameter().unwrap().name, "b");
        assert_eq!(seq.completed().len(), 1); // only the advance archive
    }

    // ===== halt =====

    #[test]
    fn test_halt_tears_down_and_blocks_transitions() {
        let mut seq = sequencer(&["a", "b"]);
        seq.halt();
        assert!(seq.is_halted());
        assert!(seq.active_optimizer().is_none());
        assert!(!seq.is_complete());
        assert_eq!(seq.advance(), None);
        assert_eq!(seq.go_back(), None);
        assert!(seq.backtrack_to("a").is_err());
    }
}
