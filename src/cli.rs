use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shot-tuner")]
#[command(version)]
#[command(about = "Sequential autotuner for projectile-launcher control parameters")]
pub struct Args {
    /// Telemetry bus server address (host or host:port)
    #[arg(long)]
    pub server: Option<String>,

    /// TOML config file; the built-in parameter set is used when omitted
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Override the control-loop rate in Hz
    #[arg(long)]
    pub tick_hz: Option<f64>,

    /// Directory for shot and parameter-history logs
    #[arg(long, default_value = "tuner_logs")]
    pub log_dir: PathBuf,

    /// Skip session data logs (diagnostic logging is unaffected)
    #[arg(long)]
    pub no_data_logs: bool,

    /// Run with the inert no-op engine: status and telemetry only
    #[arg(long)]
    pub inert: bool,

    /// Start in autotune mode regardless of the config file
    #[arg(long)]
    pub autotune: bool,
}
