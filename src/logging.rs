//! Session data logs.
//!
//! Two append-only files per session, written for offline analysis:
//! - [`ShotLog`]: one CSV row per shot (or event) with the full shot context
//!   and every parameter value in effect.
//! - [`HistoryLog`]: JSON lines, one full parameter-set snapshot per tuning
//!   event. Append-only on purpose — a crash mid-write can lose at most the
//!   last line, never the file.
//!
//! Process-level diagnostics go through `tracing`, not these files.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::info;

use crate::error::TunerError;
use crate::tuning::sample::ShotSample;

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// ShotLog
// ---------------------------------------------------------------------------

const SHOT_LOG_HEADER: &str = "timestamp,session_time_s,parameter,value,step_size,iteration,\
shot_hit,shot_distance_m,shot_angle_rad,shot_velocity_mps,shot_yaw_rad,\
target_height_m,launch_height_m,bus_connected,match_mode,status,all_parameters";

/// Row-per-shot CSV log.
pub struct ShotLog {
    path: PathBuf,
    writer: BufWriter<File>,
    session_start: Instant,
}

impl ShotLog {
    /// Create a fresh timestamped log under `dir`, writing the header row.
    pub fn create(dir: &Path) -> Result<Self, TunerError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("shot_log_{}.csv", unix_seconds() as u64));
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{SHOT_LOG_HEADER}")?;
        info!(target: "tuner::log", path = %path.display(), "shot log created");
        Ok(Self { path, writer, session_start: Instant::now() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one shot row.
    #[allow(clippy::too_many_arguments)]
    pub fn log_shot(
        &mut self,
        parameter: &str,
        value: f64,
        step_size: f64,
        iteration: u32,
        sample: &ShotSample,
        bus_connected: bool,
        match_mode: bool,
        status: &str,
        all_parameters: &BTreeMap<String, f64>,
    ) -> Result<(), TunerError> {
        let params: Vec<String> =
            all_parameters.iter().map(|(k, v)| format!("{k}={v:.6}")).collect();
        writeln!(
            self.writer,
            "{:.3},{:.3},{},{:.6},{:.6},{},{},{:.3},{:.6},{:.3},{:.6},{:.3},{:.3},{},{},{},{}",
            unix_seconds(),
            self.session_start.elapsed().as_secs_f64(),
            parameter,
            value,
            step_size,
            iteration,
            sample.hit,
            sample.distance_m,
            sample.angle_rad,
            sample.velocity_mps,
            sample.yaw_rad,
            sample.target_height_m,
            sample.launch_height_m,
            bus_connected,
            match_mode,
            status,
            params.join("; "),
        )?;
        Ok(())
    }

    /// Append an event marker row (start/stop/halt and similar).
    pub fn log_event(&mut self, event: &str, message: &str) -> Result<(), TunerError> {
        writeln!(
            self.writer,
            "{:.3},{:.3},EVENT_{},,,,,,,,,,,,,{},",
            unix_seconds(),
            self.session_start.elapsed().as_secs_f64(),
            event,
            message,
        )?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TunerError> {
        self.writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HistoryLog
// ---------------------------------------------------------------------------

/// Why a parameter-set snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    SessionStart,
    Optimization,
    ManualChange,
    Backtrack,
    AutoAdvance,
    Enabled,
    Disabled,
    SessionHalt,
}

#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    timestamp: f64,
    session_time_s: f64,
    event: HistoryEvent,
    parameters: &'a BTreeMap<String, f64>,
}

/// JSON-lines history of full parameter-set snapshots.
pub struct HistoryLog {
    path: PathBuf,
    writer: BufWriter<File>,
    session_start: Instant,
}

impl HistoryLog {
    /// Open (appending) the history file under `dir`.
    pub fn open(dir: &Path) -> Result<Self, TunerError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("parameter_history.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, writer: BufWriter::new(file), session_start: Instant::now() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one snapshot line.
    pub fn log_snapshot(
        &mut self,
        event: HistoryEvent,
        parameters: &BTreeMap<String, f64>,
    ) -> Result<(), TunerError> {
        let entry = HistoryEntry {
            timestamp: unix_seconds(),
            session_time_s: self.session_start.elapsed().as_secs_f64(),
            event,
            parameters,
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| TunerError::Config(format!("history serialization: {e}")))?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
