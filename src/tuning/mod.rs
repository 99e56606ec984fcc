//! Tuning pipeline: override resolution, sample validation and aggregation,
//! per-parameter optimization, sequencing, and the coordinating tick loop.
//!
//! Data flows bus → coordinator → validator → aggregator → sequencer →
//! optimizer and back out to the bus.

pub mod aggregate;
pub mod coordinator;
pub mod engine;
pub mod optimizer;
pub mod overrides;
pub mod sample;
pub mod sequencer;

pub use aggregate::{AggregatedObservation, SampleAggregator};
pub use coordinator::{Intent, TunerStatus, TuningCoordinator};
pub use engine::{EngineFactory, InertEngine, RandomSearchEngine, SearchEngine};
pub use optimizer::SequentialOptimizer;
pub use overrides::{resolve_auto_advance, resolve_autotune, EffectiveSettings};
pub use sample::ShotSample;
pub use sequencer::TuningSequencer;
