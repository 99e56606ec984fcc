//! Sequential black-box autotuner for projectile-launcher control
//! parameters.
//!
//! The tuner runs alongside the mechanism it tunes, communicating only over
//! a rate-limited key/value telemetry bus: it proposes a candidate value for
//! one parameter at a time, watches real shot outcomes come back, feeds the
//! aggregated result to a search engine, and walks the parameter sequence
//! with support for manual skips, backtracking, runtime threshold edits,
//! and competition-mode lockout.
//!
//! Entry point is [`tuning::TuningCoordinator`]; see `src/main.rs` for the
//! binary wiring.

pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod tuning;

pub use config::TunerConfig;
pub use error::TunerError;
pub use tuning::{Intent, TunerStatus, TuningCoordinator};
