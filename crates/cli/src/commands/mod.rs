//! CLI command implementations

pub mod replay;
pub mod topology;
pub mod virtualpod;

use anyhow::Result;
use emulator_lib::cluster::{ClusterOps, KubeCluster};
use std::path::Path;
use std::sync::Arc;

/// Connect and probe the control plane; a failed probe is fatal.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Arc<dyn ClusterOps>> {
    let cluster = match kubeconfig {
        Some(path) => KubeCluster::connect_with_kubeconfig(path).await?,
        None => KubeCluster::connect().await?,
    };
    cluster.verify_connection().await?;
    Ok(Arc::new(cluster))
}
