//! Metrics exporter for the KWOK workload emulator
//!
//! Serves the emulated telemetry read back from pod annotations as a
//! Prometheus scrape target, with a background updater refreshing the
//! snapshot on a fixed interval.

use anyhow::{Context, Result};
use clap::Parser;
use emulator_lib::{ClusterOps, EmulationConfig, KubeCluster, MetricsCollector};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod settings;

#[derive(Parser, Debug)]
#[command(name = "emulator-exporter", about = "Prometheus exporter for emulated workload telemetry", version)]
struct Args {
    /// Path to the emulation config document
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP port for the exposition endpoint
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between collection cycles
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    update_interval: Option<u64>,

    /// Explicit kubeconfig path
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Run one collection cycle, print the exposition and exit
    #[arg(long)]
    test_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let mut settings = settings::ExporterSettings::load()?;
    if let Some(config) = &args.config {
        settings.config_path = config.display().to_string();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(interval) = args.update_interval {
        settings.update_interval_secs = interval;
    }
    if let Some(kubeconfig) = &args.kubeconfig {
        settings.kubeconfig = Some(kubeconfig.display().to_string());
    }

    info!(config = %settings.config_path, port = settings.port, "Starting emulator-exporter");

    let config = Arc::new(
        EmulationConfig::load(&settings.config_path)
            .with_context(|| format!("loading {}", settings.config_path))?,
    );

    let cluster = match &settings.kubeconfig {
        Some(path) => KubeCluster::connect_with_kubeconfig(std::path::Path::new(path)).await?,
        None => KubeCluster::connect().await?,
    };
    cluster.verify_connection().await?;
    let cluster: Arc<dyn ClusterOps> = Arc::new(cluster);

    let collector = Arc::new(MetricsCollector::new(cluster, config)?);

    // First cycle up front: validates the remote state and gives /metrics
    // something to serve before the updater task takes over.
    let stats = collector.update().await?;
    info!(pods = stats.pods, nodes = stats.nodes, "initial collection cycle complete");

    if args.test_only {
        print!("{}", collector.render().await);
        return Ok(());
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let updater = tokio::spawn(collector.clone().run(
        Duration::from_secs(settings.update_interval_secs),
        shutdown_tx.subscribe(),
    ));

    let state = Arc::new(api::AppState::new(collector));
    state.ready.store(true, Ordering::SeqCst);
    let server = tokio::spawn(api::serve(settings.port, state));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());
    let _ = updater.await;
    server.abort();

    Ok(())
}
