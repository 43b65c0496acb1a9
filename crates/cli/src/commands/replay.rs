//! Time-series replay command

use crate::commands::connect;
use crate::output::{print_info, print_success, print_warning};
use anyhow::{Context, Result};
use emulator_lib::replay::{replay_pods_from_config, verify_pods, ReplaySettings, Replayer};
use emulator_lib::EmulationConfig;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

pub struct ReplayArgs {
    pub interval: u64,
    pub looped: bool,
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub verify_only: bool,
}

pub async fn run(config_path: &Path, kubeconfig: Option<&Path>, args: ReplayArgs) -> Result<()> {
    let config = EmulationConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let cluster = connect(kubeconfig).await?;
    let pods = replay_pods_from_config(&config);

    if args.verify_only {
        let outcome = verify_pods(&*cluster, &pods).await;
        if !outcome.ok() {
            for name in &outcome.missing {
                print_warning(&format!("Missing pod: {}", name));
            }
            anyhow::bail!(
                "{} of {} pods missing; run `emuctl topology` first",
                outcome.missing.len(),
                pods.len()
            );
        }
        print_success(&format!(
            "All {} pods present; {} time points ready to replay",
            outcome.found, config.metadata.time_points
        ));
        return Ok(());
    }

    let time_points = config.metadata.time_points;
    print_info(&format!(
        "Replaying {} time points over {} pods every {}s{}",
        time_points,
        pods.len(),
        args.interval,
        if args.looped { " (looping)" } else { "" }
    ));

    let replayer = Replayer::new(
        cluster,
        config.emulation.annotation_keys.clone(),
        pods,
        time_points,
        ReplaySettings {
            interval: Duration::from_secs(args.interval),
            max_concurrent: args.max_concurrent,
            batch_size: args.batch_size,
            looped: args.looped,
        },
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current tick");
            let _ = shutdown_tx.send(());
        }
    });

    let summary = replayer.run(shutdown_rx).await?;
    if summary.failed > 0 {
        print_warning(&format!(
            "Replay finished: {} ticks, {} updates, {} failures",
            summary.ticks, summary.success, summary.failed
        ));
    } else {
        print_success(&format!(
            "Replay finished: {} ticks, {} updates",
            summary.ticks, summary.success
        ));
    }

    Ok(())
}
