//! KWOK workload emulator CLI
//!
//! A command-line tool for building the fake topology, replaying workload
//! time series onto pod annotations and managing virtual pod pairs.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{replay, topology, virtualpod};
use std::path::PathBuf;

/// KWOK workload emulator CLI
#[derive(Parser)]
#[command(name = "emuctl")]
#[command(author, version, about = "CLI for the KWOK workload emulator", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, verify or delete the fake topology
    Topology {
        /// Path to the emulation config document
        #[arg(long)]
        config: PathBuf,

        /// Show what would be created without touching the cluster
        #[arg(long)]
        dry_run: bool,

        /// Only check that the topology matches the config
        #[arg(long)]
        verify_only: bool,

        /// Tear the topology down instead of creating it
        #[arg(long)]
        delete: bool,

        /// Skip the deletion confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Replay the configured time series onto pod annotations
    Replay {
        /// Path to the emulation config document
        #[arg(long)]
        config: PathBuf,

        /// Seconds between ticks
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Restart from index 0 after the last time point
        #[arg(long = "loop")]
        looped: bool,

        /// Maximum batches in flight at once
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..=20))]
        max_concurrent: u64,

        /// Pods per batch
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..=50))]
        batch_size: u64,

        /// Validate the config and connection, then exit
        #[arg(long)]
        verify_only: bool,
    },

    /// Manage virtual pod pairs
    #[command(subcommand, name = "virtual-pod")]
    VirtualPod(VirtualPodCommands),
}

#[derive(Subcommand)]
pub enum VirtualPodCommands {
    /// Create a virtual pod pair from a workload file
    Create {
        /// Logical source node name
        #[arg(long)]
        source_node: String,

        /// Logical destination node name
        #[arg(long)]
        dest_node: String,

        /// Workload time-series file
        #[arg(long)]
        workload: PathBuf,

        /// Seconds between replay ticks
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Kubeconfig for the source cluster (ambient config if not set)
        #[arg(long)]
        source_kubeconfig: Option<PathBuf>,

        /// Kubeconfig for the destination cluster (ambient config if not set)
        #[arg(long)]
        dest_kubeconfig: Option<PathBuf>,

        /// Shared KWOK node both pods are scheduled onto
        #[arg(long, default_value = "virtual-kwok-node")]
        kwok_node: String,

        /// Directory for replay artifacts
        #[arg(long, default_value = "virtual-pod-data")]
        data_dir: PathBuf,

        /// Registry file path
        #[arg(long, default_value = "virtual-pod-registry.json")]
        registry: PathBuf,
    },

    /// List registered virtual pod pairs
    List {
        /// Output format
        #[arg(long, short, default_value = "table")]
        format: output::OutputFormat,

        /// Registry file path
        #[arg(long, default_value = "virtual-pod-registry.json")]
        registry: PathBuf,
    },

    /// Delete a virtual pod pair by id
    Delete {
        /// Registry id, e.g. vp-001
        #[arg(long)]
        id: String,

        /// Kubeconfig for the source cluster (ambient config if not set)
        #[arg(long)]
        source_kubeconfig: Option<PathBuf>,

        /// Kubeconfig for the destination cluster (ambient config if not set)
        #[arg(long)]
        dest_kubeconfig: Option<PathBuf>,

        /// Directory for replay artifacts
        #[arg(long, default_value = "virtual-pod-data")]
        data_dir: PathBuf,

        /// Registry file path
        #[arg(long, default_value = "virtual-pod-registry.json")]
        registry: PathBuf,
    },

    /// Replay a single replay artifact (used as the background replayer)
    Replay {
        /// Replay artifact written at virtual pod creation
        #[arg(long)]
        series: PathBuf,

        /// Seconds between ticks
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Restart from index 0 after the last time point
        #[arg(long = "loop")]
        looped: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Topology {
            config,
            dry_run,
            verify_only,
            delete,
            yes,
        } => {
            topology::run(
                &config,
                cli.kubeconfig.as_deref(),
                topology::Mode::from_flags(dry_run, verify_only, delete),
                yes,
            )
            .await?;
        }
        Commands::Replay {
            config,
            interval,
            looped,
            max_concurrent,
            batch_size,
            verify_only,
        } => {
            replay::run(
                &config,
                cli.kubeconfig.as_deref(),
                replay::ReplayArgs {
                    interval,
                    looped,
                    max_concurrent: max_concurrent as usize,
                    batch_size: batch_size as usize,
                    verify_only,
                },
            )
            .await?;
        }
        Commands::VirtualPod(cmd) => match cmd {
            VirtualPodCommands::Create {
                source_node,
                dest_node,
                workload,
                interval,
                source_kubeconfig,
                dest_kubeconfig,
                kwok_node,
                data_dir,
                registry,
            } => {
                virtualpod::create(virtualpod::CreateArgs {
                    source_node,
                    dest_node,
                    workload,
                    interval,
                    source_kubeconfig: source_kubeconfig.or_else(|| cli.kubeconfig.clone()),
                    dest_kubeconfig: dest_kubeconfig.or_else(|| cli.kubeconfig.clone()),
                    kwok_node,
                    data_dir,
                    registry,
                })
                .await?;
            }
            VirtualPodCommands::List { format, registry } => {
                virtualpod::list(&registry, format)?;
            }
            VirtualPodCommands::Delete {
                id,
                source_kubeconfig,
                dest_kubeconfig,
                data_dir,
                registry,
            } => {
                virtualpod::delete(
                    &id,
                    source_kubeconfig.or_else(|| cli.kubeconfig.clone()).as_deref(),
                    dest_kubeconfig.or_else(|| cli.kubeconfig.clone()).as_deref(),
                    &data_dir,
                    &registry,
                )
                .await?;
            }
            VirtualPodCommands::Replay {
                series,
                interval,
                looped,
            } => {
                virtualpod::replay(&series, cli.kubeconfig.as_deref(), interval, looped).await?;
            }
        },
    }

    Ok(())
}
