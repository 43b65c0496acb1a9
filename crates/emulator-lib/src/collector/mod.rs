//! Synthetic metrics collection
//!
//! Reads the emulated telemetry back out of pod annotations, derives
//! percentages against node capacity, aggregates to node level and commits
//! the result as one atomic snapshot. The pod-to-node placement cache is
//! built exactly once: fake pod placement never changes, so re-resolving it
//! every cycle would be pure query cost.
//!
//! The collector and the replayer are separate processes that agree on the
//! current replay position only through the reserved `time_index`
//! annotation. The collector's view therefore lags the replayer's writes by
//! up to one update interval; that staleness window is part of the contract.

pub mod exposition;

use crate::cluster::{keys, ClusterOps, PodView};
use crate::config::{EmulationConfig, NodeCapacity, PsiAggregation};
use crate::error::Result;
use crate::models::{NodeMetricsAggregate, PodMetricsSnapshot, RealNodeMetrics};
use crate::observability::EmulatorMetrics;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity assumed for nodes the config does not describe (virtual pods'
/// shared KWOK node may be one of them).
const DEFAULT_CAPACITY: NodeCapacity = NodeCapacity {
    cpu_millicores: 16_000,
    memory_mi: 61_440,
};

/// One complete committed collection cycle. Readers always see a whole
/// snapshot, never a partially updated one.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub pods: BTreeMap<String, PodMetricsSnapshot>,
    pub nodes: BTreeMap<String, NodeMetricsAggregate>,
    /// `None` when no real-node series is configured; the exposition omits
    /// the group entirely in that case.
    pub real_node: Option<BTreeMap<String, RealNodeMetrics>>,
    pub time_index: usize,
}

/// Per-cycle stats for logging
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub pods: usize,
    pub nodes: usize,
}

/// Collects pod annotation state into node-level aggregates
pub struct MetricsCollector {
    cluster: Arc<dyn ClusterOps>,
    config: Arc<EmulationConfig>,
    capacities: HashMap<String, NodeCapacity>,
    /// `namespace/pod` -> node, built once on the first cycle
    pod_node_cache: DashMap<String, String>,
    cache_initialized: AtomicBool,
    current_time_index: AtomicUsize,
    cycle_count: AtomicU64,
    snapshot: RwLock<MetricsSnapshot>,
    metrics: EmulatorMetrics,
}

impl MetricsCollector {
    pub fn new(cluster: Arc<dyn ClusterOps>, config: Arc<EmulationConfig>) -> Result<Self> {
        let capacities = config.node_capacities()?;
        Ok(Self {
            cluster,
            config,
            capacities,
            pod_node_cache: DashMap::new(),
            cache_initialized: AtomicBool::new(false),
            current_time_index: AtomicUsize::new(0),
            cycle_count: AtomicU64::new(0),
            snapshot: RwLock::new(MetricsSnapshot::default()),
            metrics: EmulatorMetrics::new(),
        })
    }

    /// Namespaces to query: the configured set plus the reserved virtual-pod
    /// namespace.
    fn watched_namespaces(&self) -> BTreeSet<String> {
        let mut namespaces: BTreeSet<String> =
            self.config.namespaces.iter().cloned().collect();
        namespaces.insert(keys::VIRTUAL_POD_NAMESPACE.to_string());
        namespaces
    }

    /// Build the pod-to-node placement cache. Runs once; later cycles only
    /// fill in pods that appeared afterwards (virtual pods).
    async fn initialize_cache(&self) {
        let mut cached = 0usize;
        for ns in self.watched_namespaces() {
            let pods = match self.cluster.list_pods(&ns).await {
                Ok(pods) => pods,
                Err(e) => {
                    if !e.is_not_found() {
                        warn!(namespace = %ns, error = %e, "failed to list pods for cache");
                    }
                    continue;
                }
            };
            for pod in pods {
                if let Some(node) = pod.node_name {
                    self.pod_node_cache
                        .insert(format!("{}/{}", pod.namespace, pod.name), node);
                    cached += 1;
                }
            }
        }
        info!(entries = cached, "pod-to-node cache initialized");
        self.cache_initialized.store(true, Ordering::SeqCst);
    }

    /// Run one collection cycle and commit the snapshot atomically.
    pub async fn update(&self) -> Result<CycleStats> {
        let start = Instant::now();

        if !self.cache_initialized.load(Ordering::SeqCst) {
            self.initialize_cache().await;
        }

        let mut pod_metrics: BTreeMap<String, PodMetricsSnapshot> = BTreeMap::new();
        let mut observed_time_index: Option<usize> = None;

        for ns in self.watched_namespaces() {
            let pods = match self.cluster.list_pods(&ns).await {
                Ok(pods) => pods,
                Err(e) => {
                    if !e.is_not_found() {
                        warn!(namespace = %ns, error = %e, "failed to list pods");
                    }
                    continue;
                }
            };

            for pod in pods {
                if !pod.is_emulation_pod() && !pod.is_virtual_pod() {
                    continue;
                }

                let pod_key = format!("{}/{}", pod.namespace, pod.name);
                let node = match self.resolve_node(&pod_key, &pod) {
                    Some(node) => node,
                    None => continue,
                };

                // The replayer's write side of the time-index contract: read
                // it off the first eligible pod we encounter.
                if observed_time_index.is_none() {
                    observed_time_index = pod
                        .annotations
                        .get(keys::TIME_INDEX_ANNOTATION)
                        .and_then(|raw| raw.parse::<usize>().ok());
                }

                pod_metrics.insert(pod_key, self.pod_snapshot(&pod, node));
            }
        }

        if let Some(index) = observed_time_index {
            self.current_time_index.store(index, Ordering::SeqCst);
        }
        let time_index = self.current_time_index.load(Ordering::SeqCst);
        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst);

        let node_metrics = self.aggregate_nodes(&pod_metrics);
        let real_node = self.real_node_metrics(time_index, cycle);

        let stats = CycleStats {
            pods: pod_metrics.len(),
            nodes: node_metrics.len(),
        };

        {
            let mut snapshot = self.snapshot.write().await;
            *snapshot = MetricsSnapshot {
                pods: pod_metrics,
                nodes: node_metrics,
                real_node,
                time_index,
            };
        }

        self.metrics
            .observe_collection_cycle(start.elapsed().as_secs_f64());
        self.metrics
            .set_collection_counts(stats.pods as i64, stats.nodes as i64);
        Ok(stats)
    }

    fn resolve_node(&self, pod_key: &str, pod: &PodView) -> Option<String> {
        if let Some(cached) = self.pod_node_cache.get(pod_key) {
            return Some(cached.clone());
        }
        let node = pod.node_name.clone()?;
        self.pod_node_cache.insert(pod_key.to_string(), node.clone());
        Some(node)
    }

    fn pod_snapshot(&self, pod: &PodView, node: String) -> PodMetricsSnapshot {
        let annot = &self.config.emulation.annotation_keys;
        let cpu = parse_metric_value(pod.annotations.get(&annot.cpu), Unit::Millicores);
        let memory = parse_metric_value(pod.annotations.get(&annot.memory), Unit::Mebibytes);
        let power = parse_metric_value(pod.annotations.get(&annot.power), Unit::Plain);
        let psi = parse_metric_value(pod.annotations.get(&annot.psi), Unit::Plain);

        let capacity = self.capacity_for(&node);
        PodMetricsSnapshot {
            namespace: pod.namespace.clone(),
            pod: pod.name.clone(),
            cpu_percent: percent(cpu, capacity.cpu_millicores),
            memory_percent: percent(memory, capacity.memory_mi),
            cpu_millicores: cpu,
            memory_mi: memory,
            power_watts: power,
            psi_percent: psi,
            node,
        }
    }

    fn aggregate_nodes(
        &self,
        pods: &BTreeMap<String, PodMetricsSnapshot>,
    ) -> BTreeMap<String, NodeMetricsAggregate> {
        let mut by_node: BTreeMap<&str, Vec<&PodMetricsSnapshot>> = BTreeMap::new();
        for snapshot in pods.values() {
            by_node.entry(&snapshot.node).or_default().push(snapshot);
        }

        by_node
            .into_iter()
            .map(|(node, pods)| {
                let capacity = self.capacity_for(node);
                let aggregate =
                    aggregate_node(&pods, capacity, self.config.emulation.psi_aggregation);
                (node.to_string(), aggregate)
            })
            .collect()
    }

    fn real_node_metrics(
        &self,
        time_index: usize,
        cycle: u64,
    ) -> Option<BTreeMap<String, RealNodeMetrics>> {
        let series = self.config.node_time_series.as_ref()?;
        if series.is_empty() {
            return Some(BTreeMap::new());
        }
        let node_name = self.config.real_node_name()?.to_string();

        // Which clock drives the series is a config decision, not a given:
        // the replayed time index and the collector's cycle counter need not
        // share a step size.
        let index = if self.config.emulation.real_node_follows_replay {
            time_index % series.len()
        } else {
            (cycle as usize) % series.len()
        };
        let sample = &series[index];

        let capacity = self.capacity_for(&node_name);
        let mut map = BTreeMap::new();
        map.insert(
            node_name,
            RealNodeMetrics {
                cpu_percent: sample.node_cpu_load,
                memory_percent: percent(sample.node_memory, capacity.memory_mi),
                power_watts: sample.node_power,
                psi_percent: sample.node_psi,
            },
        );
        Some(map)
    }

    fn capacity_for(&self, node: &str) -> NodeCapacity {
        self.capacities.get(node).copied().unwrap_or(DEFAULT_CAPACITY)
    }

    /// Clone of the last committed snapshot.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Render the last committed snapshot in exposition format, holding the
    /// read side of the snapshot lock for the duration.
    pub async fn render(&self) -> String {
        let snapshot = self.snapshot.read().await;
        exposition::render(&snapshot)
    }

    /// Background updater: one cycle, then sleep `interval` in one-second
    /// increments so a shutdown signal is observed within about a second.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(interval_secs = interval.as_secs(), "metrics updater started");
        loop {
            match self.update().await {
                Ok(stats) if stats.pods == 0 => {
                    warn!("collection cycle observed no eligible pods");
                }
                Ok(stats) => {
                    debug!(pods = stats.pods, nodes = stats.nodes, "collection cycle complete");
                }
                Err(e) => {
                    self.metrics.inc_collection_errors();
                    warn!(error = %e, "collection cycle failed");
                }
            }

            let mut slept = Duration::ZERO;
            while slept < interval {
                let step = std::cmp::min(Duration::from_secs(1), interval - slept);
                tokio::select! {
                    _ = tokio::time::sleep(step) => slept += step,
                    _ = shutdown.recv() => {
                        info!("metrics updater stopped");
                        return;
                    }
                }
            }
        }
    }
}

/// Unit suffix handling for annotation values
#[derive(Debug, Clone, Copy)]
enum Unit {
    Millicores,
    Mebibytes,
    Plain,
}

/// Parse an annotation value, stripping the unit suffix. Unparsable or
/// missing values are 0.0, never an error.
fn parse_metric_value(raw: Option<&String>, unit: Unit) -> f64 {
    let raw = match raw {
        Some(raw) => raw.trim(),
        None => return 0.0,
    };
    let stripped = match unit {
        Unit::Millicores => raw.strip_suffix('m').unwrap_or(raw),
        Unit::Mebibytes => raw.strip_suffix("Mi").unwrap_or(raw),
        Unit::Plain => raw,
    };
    stripped.parse::<f64>().unwrap_or(0.0)
}

/// `raw / capacity * 100`, exactly 0 when capacity is 0.
fn percent(raw: f64, capacity: i64) -> f64 {
    if capacity > 0 {
        raw / capacity as f64 * 100.0
    } else {
        0.0
    }
}

/// Aggregate the pods placed on one node. Empty input yields all zeros
/// regardless of the PSI policy.
fn aggregate_node(
    pods: &[&PodMetricsSnapshot],
    capacity: NodeCapacity,
    psi_policy: PsiAggregation,
) -> NodeMetricsAggregate {
    if pods.is_empty() {
        return NodeMetricsAggregate::default();
    }

    let cpu: f64 = pods.iter().map(|p| p.cpu_millicores).sum();
    let memory: f64 = pods.iter().map(|p| p.memory_mi).sum();
    let power: f64 = pods.iter().map(|p| p.power_watts).sum();
    let psi = match psi_policy {
        PsiAggregation::Sum => pods.iter().map(|p| p.psi_percent).sum(),
        PsiAggregation::Max => pods
            .iter()
            .map(|p| p.psi_percent)
            .fold(f64::MIN, f64::max),
        PsiAggregation::Avg => {
            pods.iter().map(|p| p.psi_percent).sum::<f64>() / pods.len() as f64
        }
    };

    NodeMetricsAggregate {
        cpu_percent: percent(cpu, capacity.cpu_millicores),
        memory_percent: percent(memory, capacity.memory_mi),
        cpu_millicores: cpu,
        memory_mi: memory,
        power_watts: power,
        psi_percent: psi,
        pod_count: pods.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::{emulation_pod, MockCluster};

    const CPU_KEY: &str = "emulation.metrics.k8s.io/cpu";
    const MEMORY_KEY: &str = "emulation.metrics.k8s.io/memory";
    const POWER_KEY: &str = "emulation.metrics.k8s.io/power";
    const PSI_KEY: &str = "emulation.metrics.k8s.io/psi";

    fn test_config(psi: &str) -> Arc<EmulationConfig> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "metadata": { "total_pods": 2, "total_namespaces": 1, "time_points": 3 },
                "node_config": {
                    "mode": "single",
                    "single_node": { "name": "emulation-node-1", "cpu": "16", "memory": "61440Mi" }
                },
                "namespaces": ["workload-a"],
                "pods": [
                    { "namespace": "workload-a", "pod_name": "pod-1",
                      "time_series": [{ "cpu": 1, "memory": 1, "power": 1.0, "psi": 1.0 }] }
                ],
                "emulation": {
                    "annotation_keys": {
                        "cpu": CPU_KEY, "memory": MEMORY_KEY,
                        "power": POWER_KEY, "psi": PSI_KEY,
                        "timestamp": "emulation.metrics.k8s.io/timestamp"
                    },
                    "psi_aggregation": psi
                },
                "node_time_series": [
                    { "node_cpu_load": 10.0, "node_memory": 6144.0, "node_power": 100.0, "node_psi": 1.0 },
                    { "node_cpu_load": 20.0, "node_memory": 12288.0, "node_power": 200.0, "node_psi": 2.0 },
                    { "node_cpu_load": 30.0, "node_memory": 18432.0, "node_power": 300.0, "node_psi": 3.0 }
                ]
            }))
            .unwrap(),
        )
    }

    fn pod_snap(psi: f64) -> PodMetricsSnapshot {
        PodMetricsSnapshot {
            namespace: "ns".into(),
            pod: "p".into(),
            node: "n".into(),
            cpu_millicores: 0.0,
            cpu_percent: 0.0,
            memory_mi: 0.0,
            memory_percent: 0.0,
            power_watts: 0.0,
            psi_percent: psi,
        }
    }

    #[test]
    fn test_percent_clamps_zero_capacity() {
        assert_eq!(percent(500.0, 0), 0.0);
        assert_eq!(percent(0.0, 0), 0.0);
        assert!((percent(4000.0, 16000) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_metric_value_suffixes() {
        assert_eq!(
            parse_metric_value(Some(&"500m".to_string()), Unit::Millicores),
            500.0
        );
        assert_eq!(
            parse_metric_value(Some(&"256Mi".to_string()), Unit::Mebibytes),
            256.0
        );
        assert_eq!(
            parse_metric_value(Some(&"12.5".to_string()), Unit::Plain),
            12.5
        );
        // Unparsable and missing values default to zero, never an error.
        assert_eq!(
            parse_metric_value(Some(&"garbage".to_string()), Unit::Plain),
            0.0
        );
        assert_eq!(parse_metric_value(None, Unit::Millicores), 0.0);
    }

    #[test]
    fn test_aggregate_empty_node_is_all_zero() {
        for policy in [PsiAggregation::Sum, PsiAggregation::Max, PsiAggregation::Avg] {
            let agg = aggregate_node(&[], DEFAULT_CAPACITY, policy);
            assert_eq!(agg, NodeMetricsAggregate::default());
        }
    }

    #[test]
    fn test_psi_aggregation_policies() {
        let pods = [pod_snap(10.0), pod_snap(20.0), pod_snap(30.0)];
        let refs: Vec<&PodMetricsSnapshot> = pods.iter().collect();

        let sum = aggregate_node(&refs, DEFAULT_CAPACITY, PsiAggregation::Sum);
        assert!((sum.psi_percent - 60.0).abs() < 1e-6);

        let max = aggregate_node(&refs, DEFAULT_CAPACITY, PsiAggregation::Max);
        assert!((max.psi_percent - 30.0).abs() < 1e-6);

        let avg = aggregate_node(&refs, DEFAULT_CAPACITY, PsiAggregation::Avg);
        assert!((avg.psi_percent - 20.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_update_builds_snapshot() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_pod(emulation_pod(
            "workload-a",
            "pod-1",
            "emulation-node-1",
            &[
                (CPU_KEY, "4000m"),
                (MEMORY_KEY, "6144Mi"),
                (POWER_KEY, "55.5"),
                (PSI_KEY, "7.0"),
                (keys::TIME_INDEX_ANNOTATION, "2"),
            ],
        ));
        cluster.insert_pod(emulation_pod(
            "workload-a",
            "pod-2",
            "emulation-node-1",
            &[(CPU_KEY, "1000m"), (MEMORY_KEY, "1024Mi"), (PSI_KEY, "3.0")],
        ));
        // Ineligible pod: no emulation label, no virtual marker.
        cluster.insert_pod(PodView {
            name: "bystander".into(),
            namespace: "workload-a".into(),
            node_name: Some("emulation-node-1".into()),
            ..Default::default()
        });

        let collector =
            MetricsCollector::new(cluster, test_config("sum")).unwrap();
        let stats = collector.update().await.unwrap();
        assert_eq!(stats.pods, 2);
        assert_eq!(stats.nodes, 1);

        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.time_index, 2);

        let pod = snapshot.pods.get("workload-a/pod-1").unwrap();
        assert_eq!(pod.cpu_millicores, 4000.0);
        assert!((pod.cpu_percent - 25.0).abs() < 1e-9);
        assert!((pod.memory_percent - 10.0).abs() < 1e-9);
        assert_eq!(pod.power_watts, 55.5);

        let node = snapshot.nodes.get("emulation-node-1").unwrap();
        assert_eq!(node.cpu_millicores, 5000.0);
        assert_eq!(node.pod_count, 2);
        assert!((node.psi_percent - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_time_index_retained_when_absent() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_pod(emulation_pod(
            "workload-a",
            "pod-1",
            "emulation-node-1",
            &[(keys::TIME_INDEX_ANNOTATION, "5")],
        ));
        let collector =
            MetricsCollector::new(cluster.clone(), test_config("sum")).unwrap();

        collector.update().await.unwrap();
        assert_eq!(collector.snapshot().await.time_index, 5);

        // Replace the pod with one missing the annotation: the previous
        // index must be retained.
        cluster.pods.lock().unwrap().clear();
        cluster.insert_pod(emulation_pod("workload-a", "pod-1", "emulation-node-1", &[]));
        collector.update().await.unwrap();
        assert_eq!(collector.snapshot().await.time_index, 5);
    }

    #[tokio::test]
    async fn test_real_node_series_wraps_on_time_index() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_pod(emulation_pod(
            "workload-a",
            "pod-1",
            "emulation-node-1",
            &[(keys::TIME_INDEX_ANNOTATION, "4")],
        ));
        let collector =
            MetricsCollector::new(cluster, test_config("sum")).unwrap();
        collector.update().await.unwrap();

        let snapshot = collector.snapshot().await;
        let real = snapshot.real_node.unwrap();
        let node = real.get("emulation-node-1").unwrap();
        // index 4 mod 3 == 1
        assert_eq!(node.cpu_percent, 20.0);
        assert_eq!(node.power_watts, 200.0);
        // 12288 Mi of 61440 Mi capacity
        assert!((node.memory_percent - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_placement_cache_survives_lost_node_name() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_pod(emulation_pod("workload-a", "pod-1", "emulation-node-1", &[]));
        let collector =
            MetricsCollector::new(cluster.clone(), test_config("sum")).unwrap();
        collector.update().await.unwrap();

        // The control plane stops reporting placement; the one-time cache
        // still resolves it.
        {
            let mut pods = cluster.pods.lock().unwrap();
            for pod in pods.get_mut("workload-a").unwrap() {
                pod.node_name = None;
            }
        }
        let stats = collector.update().await.unwrap();
        assert_eq!(stats.pods, 1);
        let snapshot = collector.snapshot().await;
        assert_eq!(
            snapshot.pods.get("workload-a/pod-1").unwrap().node,
            "emulation-node-1"
        );
    }
}
