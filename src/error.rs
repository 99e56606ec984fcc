//! Crate-level error taxonomy.
//!
//! Errors split into two families the loop treats differently:
//! - transient (bus I/O) — logged, replaced with a safe default, loop continues
//! - everything else — rejected at the boundary or fatal to the tuning session

use thiserror::Error;

/// All failures surfaced by the tuner.
#[derive(Debug, Error)]
pub enum TunerError {
    /// Bus read/write failed. Transient — the tick that hit it degrades to a
    /// no-op and the loop keeps running.
    #[error("telemetry bus i/o failed: {0}")]
    Bus(String),

    /// The bus client is not connected.
    #[error("telemetry bus disconnected")]
    Disconnected,

    /// A shot sample failed physical-plausibility validation.
    #[error("invalid shot sample: {0}")]
    InvalidSample(String),

    /// Malformed configuration (e.g. `min <= default <= max` violated).
    /// Fatal at load time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backtrack or manual-override request named a parameter that is not
    /// in the active tuning order. Rejected with no state mutated.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// `suggest`/`report` called on an optimizer that already converged.
    /// Converged optimizers are terminal.
    #[error("optimizer for `{0}` has converged and is immutable")]
    OptimizerConverged(String),

    /// Too many consecutive invalid samples — the sensor/telemetry link is
    /// presumed broken. Fatal to the current session, not the process.
    #[error("tuning session halted: {0}")]
    SessionHalted(String),

    /// The optimization engine (or bus client library) is unavailable; the
    /// tuner should run in inert no-op mode instead of crashing.
    #[error("optimization engine unavailable")]
    EngineUnavailable,

    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunerError {
    /// Whether the loop should swallow this error and continue with the next
    /// tick (after logging it).
    pub fn is_transient(&self) -> bool {
        matches!(self, TunerError::Bus(_) | TunerError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_errors_are_transient() {
        assert!(TunerError::Bus("timeout".into()).is_transient());
        assert!(TunerError::Disconnected.is_transient());
    }

    #[test]
    fn test_config_and_session_errors_are_not_transient() {
        assert!(!TunerError::Config("bad bounds".into()).is_transient());
        assert!(!TunerError::SessionHalted("sensor link".into()).is_transient());
        assert!(!TunerError::UnknownParameter("x".into()).is_transient());
        assert!(!TunerError::OptimizerConverged("x".into()).is_transient());
    }

    #[test]
    fn test_display_includes_parameter_name() {
        let e = TunerError::UnknownParameter("drag_coefficient".into());
        assert!(e.to_string().contains("drag_coefficient"));
    }
}
