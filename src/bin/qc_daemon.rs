//! NODB QC Daemon
//!
//! Loads the daemon settings, connects to PostgreSQL and runs the worker pool
//! described by the pipeline file until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use nodb_qc_core::config::loader::PipelineConfigLoader;
use nodb_qc_core::config::DaemonConfig;
use nodb_qc_core::halt::HaltFlag;
use nodb_qc_core::logging::init_structured_logging_with_level;
use nodb_qc_core::pool::{PoolController, WorkerRegistry};
use nodb_qc_core::qc::{QcServices, QcSuiteRegistry};
use nodb_qc_core::store::postgres::PgSessionFactory;
use nodb_qc_core::units::LinearUnitConverter;
use nodb_qc_core::worker::{progress_worker, qc_worker, ProgressWorker, QcWorker};

/// Signals after which the daemon stops waiting for workers
const FORCE_EXIT_SIGNALS: usize = 3;

#[derive(Debug, Parser)]
#[command(name = "nodb-qc-daemon", version, about = "Run the NODB QC worker pool")]
struct Cli {
    /// Daemon settings file (TOML or YAML); NODB__* environment variables override it
    #[arg(short, long, env = "NODB_CONFIG")]
    config: Option<PathBuf>,

    /// Pipeline file, overriding the settings file
    #[arg(short, long)]
    pipeline: Option<PathBuf>,

    /// Reload flag file, overriding the settings file
    #[arg(long)]
    flag_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum database connections
    #[arg(long, default_value_t = 10)]
    max_connections: u32,
}

impl Cli {
    fn log_level(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_structured_logging_with_level(cli.log_level());

    let mut settings = DaemonConfig::load(cli.config.as_deref()).context("loading daemon settings")?;
    if let Some(pipeline) = cli.pipeline {
        settings.pipeline_file = pipeline;
    }
    if let Some(flag_file) = cli.flag_file {
        settings.reload_flag_file = Some(flag_file);
    }
    let database_url = settings
        .database_url
        .clone()
        .context("database_url is not configured (set NODB__DATABASE_URL)")?;

    let store = Arc::new(
        PgSessionFactory::connect(&database_url, cli.max_connections)
            .await
            .context("connecting to the database")?,
    );
    let services = QcServices::new(Arc::new(LinearUnitConverter::new()), store.clone(), store.clone());

    let mut registry = WorkerRegistry::new();
    registry.register(
        qc_worker::CLASS_NAME,
        QcWorker::factory(Arc::new(QcSuiteRegistry::with_defaults()), services),
    );
    registry.register(
        progress_worker::CLASS_NAME,
        ProgressWorker::factory(settings.workflow_dir.clone()),
    );

    let halt = HaltFlag::new();
    spawn_signal_listener(halt.clone());

    let loader = PipelineConfigLoader::new(&settings.pipeline_file, settings.reload_flag_file.clone());
    let controller = PoolController::new(registry, store, halt)
        .with_loader(loader)
        .with_tick_interval(settings.tick_interval());

    info!(pipeline = %settings.pipeline_file.display(), "🚀 Starting NODB QC daemon");
    controller.run().await.context("worker pool failed")?;
    info!("🛑 NODB QC daemon stopped");
    Ok(())
}

/// Halt on the first two interrupt signals, exit immediately on the third
fn spawn_signal_listener(halt: HaltFlag) {
    tokio::spawn(async move {
        if let Err(e) = listen_for_signals(&halt).await {
            warn!(error = %e, "Signal listener failed");
        }
    });
}

fn on_signal(received: usize, halt: &HaltFlag) {
    if received >= FORCE_EXIT_SIGNALS {
        warn!("Third interrupt received, exiting immediately");
        std::process::exit(1);
    }
    warn!(received, "Interrupt received, halting after current work");
    halt.trip();
}

#[cfg(unix)]
async fn listen_for_signals(halt: &HaltFlag) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut received = 0usize;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
        received += 1;
        on_signal(received, halt);
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(halt: &HaltFlag) -> std::io::Result<()> {
    let mut received = 0usize;
    loop {
        tokio::signal::ctrl_c().await?;
        received += 1;
        on_signal(received, halt);
    }
}
