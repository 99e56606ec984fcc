use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shot_tuner::bus::InMemoryBus;
use shot_tuner::cli::Args;
use shot_tuner::config::{ParameterSpec, TunerConfig};
use shot_tuner::error::TunerError;
use shot_tuner::tuning::engine::{InertEngine, RandomSearchEngine, SearchEngine};
use shot_tuner::tuning::TuningCoordinator;

#[tokio::main]
async fn main() -> Result<(), TunerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TunerConfig::load(path)?,
        None => TunerConfig::default(),
    };
    if let Some(hz) = args.tick_hz {
        config.tick_hz = hz;
    }
    if args.autotune {
        config.global.autotune_enabled = true;
    }
    config.validate()?;

    let n_initial = config.optimizer.n_initial_points;
    let factory: Arc<dyn Fn(&ParameterSpec) -> Box<dyn SearchEngine> + Send + Sync> =
        if args.inert {
            info!("inert engine selected, no optimization will run");
            Arc::new(|spec| Box::new(InertEngine::new(spec)))
        } else {
            Arc::new(move |spec| Box::new(RandomSearchEngine::new(spec, n_initial)))
        };

    let mut coordinator = TuningCoordinator::new(config, InMemoryBus::new(), factory);
    if !args.no_data_logs {
        coordinator.attach_logs(&args.log_dir)?;
    }
    coordinator.start(args.server.as_deref())?;

    // Ctrl-C fans out over the shutdown channel; the coordinator finishes
    // its in-flight tick, flushes logs, and releases the bus.
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for interrupt"),
        }
        let _ = shutdown_tx.send(());
    });

    coordinator.run(shutdown_rx).await;
    Ok(())
}
