//! Argus Binary Entry Point
//!
//! Runs one audit: loads configuration and targets, executes every enabled
//! collector against every target, and prints the run summary as JSON.
//! Core functionality is provided by the `argus` library crate.

use std::sync::Arc;

use argus::monitor::SysinfoSampler;
use argus::{
    AppConfig, BatchScheduler, ConnectionPool, ErrorAggregator, FileCheckpointStore,
    ResolvingConnector, ResourceMonitor, RunOptions, WorkerPool, load_targets,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Argus - Fleet Audit Orchestration
#[derive(Parser, Debug)]
#[command(name = "argus", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "argus.yaml", env = "ARGUS_CONFIG")]
    config: String,

    /// Target list: one `host[:port] [credential]` per line
    #[arg(short, long, env = "ARGUS_TARGETS")]
    targets: String,

    /// Resume the run named by --run-id from its latest checkpoint
    #[arg(long, requires = "run_id")]
    resume: bool,

    /// Run identifier (default: random UUID)
    #[arg(long, env = "ARGUS_RUN_ID")]
    run_id: Option<String>,

    /// Result directory (overrides config file)
    #[arg(long, env = "ARGUS_OUTPUT_DIR")]
    output_dir: Option<String>,

    /// Checkpoint directory (overrides config file)
    #[arg(long, env = "ARGUS_CHECKPOINT_DIR")]
    checkpoint_dir: Option<String>,

    /// Only run these collectors (comma-separated names)
    #[arg(long, value_delimiter = ',')]
    collectors: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,argus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    tracing::info!(path = %cli.config, "Loading configuration");
    let mut config = AppConfig::load_with_collector_path(&cli.config)?;

    // CLI > ENV > config file
    if let Some(dir) = cli.output_dir {
        config.run.output_dir = dir;
    }
    if let Some(dir) = cli.checkpoint_dir {
        config.run.checkpoint_dir = dir;
    }
    config.validate()?;

    let targets = load_targets(&cli.targets)?;
    let registry = config.collectors.registry()?;
    let collectors = if cli.collectors.is_empty() {
        registry.all()
    } else {
        registry.select(&cli.collectors)?
    };
    let run_id = cli
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::info!(
        run_id = %run_id,
        targets = targets.len(),
        collectors = collectors.len(),
        resume = cli.resume,
        output_dir = %config.run.output_dir,
        checkpoint_dir = %config.run.checkpoint_dir,
        "Starting audit run"
    );

    let sessions = Arc::new(ConnectionPool::with_connector(
        config.pool.session_ttl,
        Arc::new(ResolvingConnector::new(config.pool.resolve_port, config.retry)),
    ));
    let sink = config.sink_builder(&run_id).build().await?;
    let engine = Arc::new(WorkerPool::new(
        config.run.max_concurrency,
        Arc::clone(&sessions),
        sink,
        Arc::new(ErrorAggregator::new()),
    ));

    let monitor = Arc::new(ResourceMonitor::with_window(
        Box::new(SysinfoSampler::new()),
        config.monitor.window,
        config.monitor.smoothing,
    ));
    monitor.start(config.monitor.interval);

    let scheduler = BatchScheduler::new(
        config.scheduler_config(&run_id),
        engine,
        Arc::clone(&monitor),
        Arc::new(FileCheckpointStore::new(config.checkpoint_dir(), &run_id)),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let options = RunOptions::new(config.run.batch_size, config.run.pipeline_depth)
        .with_resume(cli.resume)
        .with_cancel(cancel);
    let result = scheduler.run_with(targets, collectors, options).await;

    let monitor_summary = monitor.stop().await;
    sessions.close();
    tracing::debug!(
        samples = monitor_summary.samples,
        peak_cpu = monitor_summary.peak_cpu,
        peak_memory = monitor_summary.peak_memory,
        "Resource monitor stopped"
    );

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.aborted {
        tracing::warn!(
            run_id = %summary.run_id,
            "Run aborted; rerun with --resume --run-id {} to continue",
            summary.run_id
        );
    }
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, cancelling run");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, cancelling run");
        }
    }
    cancel.cancel();
}
