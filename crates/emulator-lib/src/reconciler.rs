//! Fake topology reconciliation
//!
//! Idempotently drives the control plane toward the configured node /
//! namespace / pod topology. Existing resources are skipped, per-resource
//! failures are counted and never abort the batch, and deletion undoes
//! creation in reverse dependency order.

use crate::cluster::{ClusterOps, NodeManifest, PodManifest};
use crate::config::EmulationConfig;
use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one ensure call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Skipped,
    Failed,
}

/// Aggregate created/skipped/failed counts for a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileCounts {
    fn record(&mut self, outcome: EnsureOutcome) {
        match outcome {
            EnsureOutcome::Created => self.created += 1,
            EnsureOutcome::Skipped => self.skipped += 1,
            EnsureOutcome::Failed => self.failed += 1,
        }
    }
}

/// Full report for an apply pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileReport {
    pub nodes: ReconcileCounts,
    pub namespaces: ReconcileCounts,
    pub pods: ReconcileCounts,
}

impl ReconcileReport {
    pub fn failed_total(&self) -> usize {
        self.nodes.failed + self.namespaces.failed + self.pods.failed
    }
}

/// Verification summary for an existing topology
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub missing_nodes: Vec<String>,
    pub missing_namespaces: Vec<String>,
    pub pod_counts: Vec<(String, usize)>,
    pub expected_pods: usize,
    pub found_pods: usize,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.missing_nodes.is_empty()
            && self.missing_namespaces.is_empty()
            && self.found_pods == self.expected_pods
    }
}

/// Reconciles the configured fake topology against the control plane
pub struct ResourceReconciler {
    cluster: Arc<dyn ClusterOps>,
    config: Arc<EmulationConfig>,
    dry_run: bool,
}

impl ResourceReconciler {
    pub fn new(cluster: Arc<dyn ClusterOps>, config: Arc<EmulationConfig>) -> Self {
        Self {
            cluster,
            config,
            dry_run: false,
        }
    }

    /// In dry-run mode every mutation is logged and skipped.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Ensure a fake node exists. Existing nodes are skipped, never an error.
    pub async fn ensure_node(&self, name: &str, cpu: &str, memory: &str) -> Result<EnsureOutcome> {
        match self.cluster.node_exists(name).await {
            Ok(true) => {
                info!(node = %name, "node already exists, skipping");
                return Ok(EnsureOutcome::Skipped);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(node = %name, error = %e, "node lookup failed");
                return Ok(EnsureOutcome::Failed);
            }
        }

        if self.dry_run {
            info!(node = %name, cpu = %cpu, memory = %memory, "[dry-run] would create node");
            return Ok(EnsureOutcome::Created);
        }

        let manifest = NodeManifest {
            name: name.to_string(),
            cpu: cpu.to_string(),
            memory: memory.to_string(),
        };
        match self.cluster.apply_node(&manifest).await {
            Ok(()) => {
                info!(node = %name, cpu = %cpu, memory = %memory, "created node");
                Ok(EnsureOutcome::Created)
            }
            Err(e) => {
                warn!(node = %name, error = %e, "failed to create node");
                Ok(EnsureOutcome::Failed)
            }
        }
    }

    /// Ensure a namespace exists.
    pub async fn ensure_namespace(&self, name: &str) -> Result<EnsureOutcome> {
        match self.cluster.namespace_exists(name).await {
            Ok(true) => {
                info!(namespace = %name, "namespace already exists, skipping");
                return Ok(EnsureOutcome::Skipped);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(namespace = %name, error = %e, "namespace lookup failed");
                return Ok(EnsureOutcome::Failed);
            }
        }

        if self.dry_run {
            info!(namespace = %name, "[dry-run] would create namespace");
            return Ok(EnsureOutcome::Created);
        }

        match self.cluster.apply_namespace(name).await {
            Ok(()) => {
                info!(namespace = %name, "created namespace");
                Ok(EnsureOutcome::Created)
            }
            Err(e) => {
                warn!(namespace = %name, error = %e, "failed to create namespace");
                Ok(EnsureOutcome::Failed)
            }
        }
    }

    /// Ensure a fake pod exists on its assigned node.
    pub async fn ensure_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        node: &str,
        existing: &HashSet<String>,
    ) -> Result<EnsureOutcome> {
        if existing.contains(pod_name) {
            return Ok(EnsureOutcome::Skipped);
        }

        if self.dry_run {
            info!(namespace = %namespace, pod = %pod_name, node = %node, "[dry-run] would create pod");
            return Ok(EnsureOutcome::Created);
        }

        let manifest = PodManifest::emulation(namespace, pod_name, node);
        match self.cluster.apply_pod(&manifest).await {
            Ok(()) => Ok(EnsureOutcome::Created),
            Err(e) => {
                warn!(namespace = %namespace, pod = %pod_name, error = %e, "failed to create pod");
                Ok(EnsureOutcome::Failed)
            }
        }
    }

    /// Create everything the config describes: nodes, then namespaces, then
    /// pods. Returns aggregate counts; failures never abort the pass.
    pub async fn apply_all(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for node in self.config.node_entries() {
            let outcome = self.ensure_node(&node.name, &node.cpu, &node.memory).await?;
            report.nodes.record(outcome);
        }

        for ns in &self.config.namespaces {
            let outcome = self.ensure_namespace(ns).await?;
            report.namespaces.record(outcome);
        }

        // One existence query per namespace instead of one per pod.
        for ns in &self.config.namespaces {
            let existing = self.existing_pod_names(ns).await;
            let node = self.config.node_for_namespace(ns)?.name.clone();
            for pod in self.config.pods.iter().filter(|p| &p.namespace == ns) {
                let outcome = self
                    .ensure_pod(ns, &pod.pod_name, &node, &existing)
                    .await?;
                report.pods.record(outcome);
            }
        }

        info!(
            nodes_created = report.nodes.created,
            pods_created = report.pods.created,
            pods_skipped = report.pods.skipped,
            pods_failed = report.pods.failed,
            "topology apply complete"
        );
        Ok(report)
    }

    /// Tear everything down in reverse dependency order: pods, then their
    /// namespaces, then nodes.
    pub async fn delete_all(&self) -> Result<()> {
        for ns in &self.config.namespaces {
            for name in self.existing_pod_names(ns).await {
                if self.dry_run {
                    info!(namespace = %ns, pod = %name, "[dry-run] would delete pod");
                    continue;
                }
                if let Err(e) = self.cluster.delete_pod(ns, &name).await {
                    warn!(namespace = %ns, pod = %name, error = %e, "failed to delete pod");
                }
            }

            if self.dry_run {
                info!(namespace = %ns, "[dry-run] would delete namespace");
                continue;
            }
            if let Err(e) = self.cluster.delete_namespace(ns).await {
                if !e.is_not_found() {
                    warn!(namespace = %ns, error = %e, "failed to delete namespace");
                }
            }
        }

        for node in self.config.node_entries() {
            if self.dry_run {
                info!(node = %node.name, "[dry-run] would delete node");
                continue;
            }
            if let Err(e) = self.cluster.delete_node(&node.name).await {
                if !e.is_not_found() {
                    warn!(node = %node.name, error = %e, "failed to delete node");
                }
            }
        }

        info!("topology deletion complete");
        Ok(())
    }

    /// Check that everything the config describes is present.
    pub async fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport {
            expected_pods: self.config.pods.len(),
            ..Default::default()
        };

        for node in self.config.node_entries() {
            if !self.cluster.node_exists(&node.name).await.unwrap_or(false) {
                report.missing_nodes.push(node.name.clone());
            }
        }

        for ns in &self.config.namespaces {
            if !self.cluster.namespace_exists(ns).await.unwrap_or(false) {
                report.missing_namespaces.push(ns.clone());
            }
        }

        for ns in &self.config.namespaces {
            let existing = self.existing_pod_names(ns).await;
            let expected: Vec<&str> = self
                .config
                .pods
                .iter()
                .filter(|p| &p.namespace == ns)
                .map(|p| p.pod_name.as_str())
                .collect();
            let found = expected
                .iter()
                .filter(|name| existing.contains(**name))
                .count();
            report.found_pods += found;
            report.pod_counts.push((ns.clone(), found));
        }

        Ok(report)
    }

    async fn existing_pod_names(&self, namespace: &str) -> HashSet<String> {
        match self.cluster.list_pods(namespace).await {
            Ok(pods) => pods.into_iter().map(|p| p.name).collect(),
            Err(e) => {
                if !e.is_not_found() {
                    warn!(namespace = %namespace, error = %e, "failed to list pods");
                }
                HashSet::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::MockCluster;

    fn sample_config() -> Arc<EmulationConfig> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "metadata": { "total_pods": 2, "total_namespaces": 1, "time_points": 1 },
                "node_config": {
                    "mode": "single",
                    "single_node": { "name": "emulation-node-1", "cpu": "16", "memory": "64Gi" }
                },
                "namespaces": ["workload-a"],
                "pods": [
                    { "namespace": "workload-a", "pod_name": "pod-1",
                      "time_series": [{ "cpu": 1, "memory": 1, "power": 1.0, "psi": 1.0 }] },
                    { "namespace": "workload-a", "pod_name": "pod-2",
                      "time_series": [{ "cpu": 1, "memory": 1, "power": 1.0, "psi": 1.0 }] }
                ],
                "emulation": {
                    "annotation_keys": {
                        "cpu": "emulation.metrics.k8s.io/cpu",
                        "memory": "emulation.metrics.k8s.io/memory",
                        "power": "emulation.metrics.k8s.io/power",
                        "psi": "emulation.metrics.k8s.io/psi",
                        "timestamp": "emulation.metrics.k8s.io/timestamp"
                    }
                }
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_apply_all_creates_everything() {
        let cluster = Arc::new(MockCluster::new());
        let reconciler = ResourceReconciler::new(cluster.clone(), sample_config());

        let report = reconciler.apply_all().await.unwrap();
        assert_eq!(report.nodes.created, 1);
        assert_eq!(report.namespaces.created, 1);
        assert_eq!(report.pods.created, 2);
        assert_eq!(report.failed_total(), 0);
    }

    #[tokio::test]
    async fn test_apply_all_is_idempotent() {
        let cluster = Arc::new(MockCluster::new());
        let reconciler = ResourceReconciler::new(cluster.clone(), sample_config());

        reconciler.apply_all().await.unwrap();
        let second = reconciler.apply_all().await.unwrap();

        assert_eq!(second.nodes.skipped, 1);
        assert_eq!(second.namespaces.skipped, 1);
        assert_eq!(second.pods.skipped, 2);
        assert_eq!(second.pods.created, 0);
    }

    #[tokio::test]
    async fn test_pod_failure_does_not_abort_batch() {
        let cluster = Arc::new(MockCluster::new());
        cluster.fail_resource("workload-a/pod-1");
        let reconciler = ResourceReconciler::new(cluster.clone(), sample_config());

        let report = reconciler.apply_all().await.unwrap();
        assert_eq!(report.pods.failed, 1);
        // The batch continued past the failure.
        assert_eq!(report.pods.created, 1);
    }

    #[tokio::test]
    async fn test_delete_order_pods_then_namespaces_then_nodes() {
        let cluster = Arc::new(MockCluster::new());
        let reconciler = ResourceReconciler::new(cluster.clone(), sample_config());
        reconciler.apply_all().await.unwrap();

        reconciler.delete_all().await.unwrap();

        let ops = cluster.operations.lock().unwrap().clone();
        let pod_pos = ops
            .iter()
            .position(|op| op.starts_with("delete-pod"))
            .unwrap();
        let ns_pos = ops
            .iter()
            .position(|op| op.starts_with("delete-namespace"))
            .unwrap();
        let node_pos = ops
            .iter()
            .position(|op| op.starts_with("delete-node"))
            .unwrap();
        assert!(pod_pos < ns_pos);
        assert!(ns_pos < node_pos);
    }

    #[tokio::test]
    async fn test_dry_run_performs_no_mutations() {
        let cluster = Arc::new(MockCluster::new());
        let reconciler =
            ResourceReconciler::new(cluster.clone(), sample_config()).dry_run(true);

        let report = reconciler.apply_all().await.unwrap();
        assert_eq!(report.pods.created, 2);
        assert!(cluster.operations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_reports_missing() {
        let cluster = Arc::new(MockCluster::new());
        let reconciler = ResourceReconciler::new(cluster.clone(), sample_config());

        let before = reconciler.verify().await.unwrap();
        assert!(!before.ok());
        assert_eq!(before.missing_nodes, vec!["emulation-node-1".to_string()]);

        reconciler.apply_all().await.unwrap();
        let after = reconciler.verify().await.unwrap();
        assert!(after.ok());
        assert_eq!(after.found_pods, 2);
    }
}
