//! Virtual pod pair commands

use crate::commands::connect;
use crate::output::{color_status, print_info, print_success, print_table, OutputFormat};
use anyhow::{Context, Result};
use emulator_lib::cluster::{ClusterOps, NodeManifest};
use emulator_lib::config::AnnotationKeys;
use emulator_lib::replay::{ReplayPod, ReplaySettings, Replayer};
use emulator_lib::virtualpod::{
    registry::Registry, KubeNodeTarget, ReplayArtifact, VirtualPodManager, VirtualPodSettings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tokio::sync::broadcast;
use tracing::info;

pub struct CreateArgs {
    pub source_node: String,
    pub dest_node: String,
    pub workload: PathBuf,
    pub interval: u64,
    pub source_kubeconfig: Option<PathBuf>,
    pub dest_kubeconfig: Option<PathBuf>,
    pub kwok_node: String,
    pub data_dir: PathBuf,
    pub registry: PathBuf,
}

/// Row for the virtual pod table
#[derive(Tabled, serde::Serialize)]
struct VirtualPodRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Destination")]
    dest: String,
    #[tabled(rename = "Interval")]
    interval: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "Created")]
    created_at: String,
    #[tabled(rename = "Status")]
    status: String,
}

pub async fn create(args: CreateArgs) -> Result<()> {
    let source_cluster = connect(args.source_kubeconfig.as_deref()).await?;
    let dest_cluster = connect(args.dest_kubeconfig.as_deref()).await?;

    ensure_kwok_node(&*source_cluster, &args.kwok_node).await?;
    ensure_kwok_node(&*dest_cluster, &args.kwok_node).await?;

    let source = Arc::new(KubeNodeTarget::new(
        &args.source_node,
        source_cluster,
        &args.data_dir,
    ));
    let dest = Arc::new(KubeNodeTarget::new(
        &args.dest_node,
        dest_cluster,
        &args.data_dir,
    ));

    let manager = VirtualPodManager::new(
        source,
        dest,
        Registry::new(&args.registry),
        VirtualPodSettings {
            kwok_node: args.kwok_node.clone(),
            annotation_keys: AnnotationKeys::default(),
        },
    );

    let record = manager.create(&args.workload, args.interval).await?;
    print_success(&format!(
        "Virtual pod {} created: {} on {} -> {} on {}",
        record.id, record.source_pod_name, record.source_node, record.dest_pod_name, record.dest_node
    ));
    Ok(())
}

pub fn list(registry: &Path, format: OutputFormat) -> Result<()> {
    let records = Registry::new(registry).list()?;
    let rows: Vec<VirtualPodRow> = records
        .into_iter()
        .map(|r| VirtualPodRow {
            id: r.id,
            source: format!("{}/{}", r.source_node, r.source_pod_name),
            dest: format!("{}/{}", r.dest_node, r.dest_pod_name),
            interval: format!("{}s", r.interval),
            pid: r
                .replayer_pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            created_at: r.created_at,
            status: color_status(&format!("{:?}", r.status).to_lowercase()),
        })
        .collect();
    print_table(&rows, format);
    Ok(())
}

pub async fn delete(
    id: &str,
    source_kubeconfig: Option<&Path>,
    dest_kubeconfig: Option<&Path>,
    data_dir: &Path,
    registry: &Path,
) -> Result<()> {
    // The record names the targets; read it before building them.
    let record = Registry::new(registry).get(id)?;

    let source_cluster = connect(source_kubeconfig).await?;
    let dest_cluster = connect(dest_kubeconfig).await?;
    let source = Arc::new(KubeNodeTarget::new(
        &record.source_node,
        source_cluster,
        data_dir,
    ));
    let dest = Arc::new(KubeNodeTarget::new(&record.dest_node, dest_cluster, data_dir));

    let manager = VirtualPodManager::new(
        source,
        dest,
        Registry::new(registry),
        VirtualPodSettings {
            kwok_node: record.kwok_node.clone(),
            annotation_keys: AnnotationKeys::default(),
        },
    );

    let removed = manager.delete(id).await?;
    print_success(&format!("Virtual pod {} deleted", removed.id));
    Ok(())
}

/// The single-pod replayer spawned in the background at creation time.
pub async fn replay(
    series: &Path,
    kubeconfig: Option<&Path>,
    interval: u64,
    looped: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(series)
        .with_context(|| format!("loading {}", series.display()))?;
    let artifact: ReplayArtifact =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", series.display()))?;
    if artifact.time_series.is_empty() {
        anyhow::bail!("{} has an empty time series", series.display());
    }

    let cluster = connect(kubeconfig).await?;
    let time_points = artifact.time_series.len();
    print_info(&format!(
        "Replaying {} time points onto {}/{}",
        time_points, artifact.namespace, artifact.pod
    ));

    let pod = ReplayPod {
        namespace: artifact.namespace,
        name: artifact.pod,
        series: artifact.time_series,
    };
    let replayer = Replayer::new(
        cluster,
        AnnotationKeys::default(),
        vec![pod],
        time_points,
        ReplaySettings {
            interval: Duration::from_secs(interval),
            max_concurrent: 1,
            batch_size: 1,
            looped,
        },
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping replay");
            let _ = shutdown_tx.send(());
        }
    });

    replayer.run(shutdown_rx).await?;
    Ok(())
}

/// The shared KWOK node virtual pods are scheduled onto; created on demand
/// with a generic capacity.
async fn ensure_kwok_node(cluster: &dyn ClusterOps, name: &str) -> Result<()> {
    if cluster.node_exists(name).await? {
        return Ok(());
    }
    cluster
        .apply_node(&NodeManifest {
            name: name.to_string(),
            cpu: "16".to_string(),
            memory: "60Gi".to_string(),
        })
        .await?;
    info!(node = %name, "created shared KWOK node");
    Ok(())
}
