//! Time-series replay onto pod annotations
//!
//! Each tick applies one time point of every pod's series as an annotation
//! patch. Updating every pod in its own task storms the control plane, so
//! pods are grouped into batches and the batches run under a bounded worker
//! pool: `max_concurrent` batches in flight, pods within a batch patched
//! sequentially. The batch is the unit of parallelism, which keeps the
//! connection count predictable.

use crate::cluster::{keys, ClusterOps};
use crate::config::{AnnotationKeys, MetricSample};
use crate::error::Result;
use crate::observability::EmulatorMetrics;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

/// One pod under replay, carrying its own positional time series
#[derive(Debug, Clone)]
pub struct ReplayPod {
    pub namespace: String,
    pub name: String,
    pub series: Vec<MetricSample>,
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub interval: Duration,
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub looped: bool,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_concurrent: 5,
            batch_size: 10,
            looped: false,
        }
    }
}

/// Outcome of a single tick, read only after every batch worker has joined
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub time_index: usize,
    pub success: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaySummary {
    pub ticks: usize,
    pub success: u64,
    pub failed: u64,
}

#[derive(Default)]
struct TickCounts {
    success: u64,
    failed: u64,
}

pub struct Replayer {
    cluster: Arc<dyn ClusterOps>,
    annotation_keys: AnnotationKeys,
    pods: Arc<Vec<ReplayPod>>,
    time_points: usize,
    settings: ReplaySettings,
    cancelled: Arc<AtomicBool>,
    metrics: EmulatorMetrics,
}

impl Replayer {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        annotation_keys: AnnotationKeys,
        pods: Vec<ReplayPod>,
        time_points: usize,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            cluster,
            annotation_keys,
            pods: Arc::new(pods),
            time_points,
            settings,
            cancelled: Arc::new(AtomicBool::new(false)),
            metrics: EmulatorMetrics::new(),
        }
    }

    /// Run the replay to completion or until the shutdown channel fires.
    /// In loop mode the sequence restarts from index 0 after one more
    /// interval; a non-looping run does not sleep after its final tick.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<ReplaySummary> {
        // An empty sequence in loop mode would otherwise spin without ever
        // reaching the per-tick cancellation check.
        if self.time_points == 0 || self.pods.is_empty() {
            warn!(
                pods = self.pods.len(),
                time_points = self.time_points,
                "nothing to replay"
            );
            return Ok(ReplaySummary::default());
        }

        let cancelled = self.cancelled.clone();
        let watcher = tokio::spawn(async move {
            let mut shutdown = shutdown;
            let _ = shutdown.recv().await;
            cancelled.store(true, Ordering::SeqCst);
        });

        info!(
            pods = self.pods.len(),
            time_points = self.time_points,
            interval_secs = self.settings.interval.as_secs(),
            looped = self.settings.looped,
            "replay started"
        );

        let mut summary = ReplaySummary::default();
        'replay: loop {
            for index in 0..self.time_points {
                if self.cancelled.load(Ordering::SeqCst) {
                    break 'replay;
                }

                let report = self.tick(index).await;
                summary.ticks += 1;
                summary.success += report.success;
                summary.failed += report.failed;

                if report.success == 0 {
                    warn!(time_index = index, failed = report.failed, "tick applied no updates");
                } else {
                    info!(
                        time_index = index,
                        success = report.success,
                        failed = report.failed,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "tick complete"
                    );
                }

                let last_tick = index + 1 == self.time_points;
                if last_tick && !self.settings.looped {
                    break 'replay;
                }
                if self.sleep_interval().await {
                    break 'replay;
                }
            }
            if !self.settings.looped {
                break;
            }
        }

        watcher.abort();
        info!(
            ticks = summary.ticks,
            success = summary.success,
            failed = summary.failed,
            "replay finished"
        );
        Ok(summary)
    }

    /// Request cancellation from outside the run loop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Apply one time point to every pod. Batches of `batch_size` pods are
    /// submitted to at most `max_concurrent` workers; the counters are read
    /// only after all workers have joined.
    pub async fn tick(&self, time_index: usize) -> TickReport {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let counts = Arc::new(Mutex::new(TickCounts::default()));
        let mut workers = JoinSet::new();

        let total = self.pods.len();
        let batch_size = self.settings.batch_size.max(1);
        let mut offset = 0;
        while offset < total {
            // In-flight batches finish, but nothing new starts once a
            // cancellation is observed.
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let end = std::cmp::min(offset + batch_size, total);
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let cluster = self.cluster.clone();
            let pods = self.pods.clone();
            let annotation_keys = self.annotation_keys.clone();
            let counts = counts.clone();
            workers.spawn(async move {
                let _permit = permit;
                for pod in &pods[offset..end] {
                    let ok = apply_sample(&*cluster, &annotation_keys, pod, time_index).await;
                    let mut counts = counts.lock().unwrap();
                    if ok {
                        counts.success += 1;
                    } else {
                        counts.failed += 1;
                    }
                }
            });
            offset = end;
        }

        // Wait-for-all barrier before the counters are reported.
        while workers.join_next().await.is_some() {}

        let (success, failed) = {
            let counts = counts.lock().unwrap();
            (counts.success, counts.failed)
        };
        let elapsed = start.elapsed();
        self.metrics.observe_replay_tick(elapsed.as_secs_f64());
        self.metrics.add_replay_updates(success, failed);
        TickReport {
            time_index,
            success,
            failed,
            elapsed,
        }
    }

    /// Sleep the configured interval in one-second increments, returning
    /// true if cancelled mid-sleep.
    async fn sleep_interval(&self) -> bool {
        let mut slept = Duration::ZERO;
        while slept < self.settings.interval {
            if self.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            let step = std::cmp::min(Duration::from_secs(1), self.settings.interval - slept);
            tokio::time::sleep(step).await;
            slept += step;
        }
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Patch one pod with the sample at `time_index`. An index past the end of
/// the pod's series or a failed patch both count as a failure for the tick;
/// neither aborts the batch.
async fn apply_sample(
    cluster: &dyn ClusterOps,
    annotation_keys: &AnnotationKeys,
    pod: &ReplayPod,
    time_index: usize,
) -> bool {
    let sample = match pod.series.get(time_index) {
        Some(sample) => sample,
        None => {
            warn!(
                namespace = %pod.namespace,
                pod = %pod.name,
                time_index,
                series_len = pod.series.len(),
                "time index out of range for pod series"
            );
            return false;
        }
    };

    let mut annotations = BTreeMap::new();
    annotations.insert(annotation_keys.cpu.clone(), format!("{}m", sample.cpu));
    annotations.insert(annotation_keys.memory.clone(), format!("{}Mi", sample.memory));
    annotations.insert(annotation_keys.power.clone(), format!("{}", sample.power));
    annotations.insert(annotation_keys.psi.clone(), format!("{}", sample.psi));
    annotations.insert(
        annotation_keys.timestamp.clone(),
        Utc::now().to_rfc3339(),
    );
    annotations.insert(
        keys::TIME_INDEX_ANNOTATION.to_string(),
        time_index.to_string(),
    );

    match cluster
        .patch_pod_annotations(&pod.namespace, &pod.name, annotations)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(
                namespace = %pod.namespace,
                pod = %pod.name,
                error = %e,
                "annotation patch failed"
            );
            false
        }
    }
}

/// Presence check for a replay set
#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub found: usize,
    /// Missing pods as `namespace/name`
    pub missing: Vec<String>,
}

impl VerifyOutcome {
    pub fn ok(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Check that every pod in the replay set exists, one list call per
/// namespace. A missing namespace marks all of its pods missing.
pub async fn verify_pods(cluster: &dyn ClusterOps, pods: &[ReplayPod]) -> VerifyOutcome {
    let mut by_namespace: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for pod in pods {
        by_namespace
            .entry(pod.namespace.as_str())
            .or_default()
            .push(pod.name.as_str());
    }

    let mut outcome = VerifyOutcome::default();
    for (namespace, names) in by_namespace {
        let existing: std::collections::HashSet<String> = match cluster.list_pods(namespace).await
        {
            Ok(list) => list.into_iter().map(|p| p.name).collect(),
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "failed to list pods");
                Default::default()
            }
        };
        for name in names {
            if existing.contains(name) {
                outcome.found += 1;
            } else {
                outcome.missing.push(format!("{}/{}", namespace, name));
            }
        }
    }
    outcome
}

/// Build the replay set from the fixed pod topology.
pub fn replay_pods_from_config(config: &crate::config::EmulationConfig) -> Vec<ReplayPod> {
    config
        .pods
        .iter()
        .map(|entry| ReplayPod {
            namespace: entry.namespace.clone(),
            name: entry.pod_name.clone(),
            series: entry.time_series.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::{emulation_pod, MockCluster};
    use std::sync::atomic::Ordering;

    fn test_keys() -> AnnotationKeys {
        AnnotationKeys {
            cpu: "emulation.metrics.k8s.io/cpu".into(),
            memory: "emulation.metrics.k8s.io/memory".into(),
            power: "emulation.metrics.k8s.io/power".into(),
            psi: "emulation.metrics.k8s.io/psi".into(),
            timestamp: "emulation.metrics.k8s.io/timestamp".into(),
        }
    }

    fn sample(cpu: i64) -> MetricSample {
        MetricSample {
            cpu,
            memory: 256,
            power: 12.5,
            psi: 1.0,
        }
    }

    fn pods_on_cluster(cluster: &MockCluster, count: usize, points: usize) -> Vec<ReplayPod> {
        (0..count)
            .map(|i| {
                let name = format!("pod-{i}");
                cluster.insert_pod(emulation_pod("workload-a", &name, "node-1", &[]));
                ReplayPod {
                    namespace: "workload-a".into(),
                    name,
                    series: (0..points).map(|p| sample(p as i64 * 100)).collect(),
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_tick_patches_every_pod() {
        let cluster = Arc::new(MockCluster::new());
        let pods = pods_on_cluster(&cluster, 7, 3);
        let replayer = Replayer::new(
            cluster.clone(),
            test_keys(),
            pods,
            3,
            ReplaySettings {
                batch_size: 3,
                ..ReplaySettings::default()
            },
        );

        let report = replayer.tick(1).await;
        assert_eq!(report.success, 7);
        assert_eq!(report.failed, 0);

        let patches = cluster.patches.lock().unwrap();
        assert_eq!(patches.len(), 7);
        let (_, _, annotations) = &patches[0];
        assert_eq!(annotations.get(keys::TIME_INDEX_ANNOTATION).unwrap(), "1");
        assert_eq!(
            annotations.get(&test_keys().cpu).unwrap(),
            "100m"
        );
        assert_eq!(annotations.get(&test_keys().memory).unwrap(), "256Mi");
    }

    #[tokio::test]
    async fn test_tick_counts_missing_pod_as_failure() {
        let cluster = Arc::new(MockCluster::new());
        let mut pods = pods_on_cluster(&cluster, 2, 2);
        pods.push(ReplayPod {
            namespace: "workload-a".into(),
            name: "ghost".into(),
            series: vec![sample(100), sample(200)],
        });
        cluster.fail_resource("workload-a/ghost");
        let replayer = Replayer::new(
            cluster,
            test_keys(),
            pods,
            2,
            ReplaySettings::default(),
        );

        let report = replayer.tick(0).await;
        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_tick_out_of_range_index_is_failure() {
        let cluster = Arc::new(MockCluster::new());
        let pods = pods_on_cluster(&cluster, 2, 2);
        let replayer = Replayer::new(
            cluster,
            test_keys(),
            pods,
            5,
            ReplaySettings::default(),
        );

        let report = replayer.tick(4).await;
        assert_eq!(report.success, 0);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_max_concurrent() {
        let cluster = Arc::new(MockCluster::with_patch_delay(Duration::from_millis(20)));
        let pods = pods_on_cluster(&cluster, 12, 1);
        let replayer = Replayer::new(
            cluster.clone(),
            test_keys(),
            pods,
            1,
            ReplaySettings {
                max_concurrent: 2,
                batch_size: 1,
                ..ReplaySettings::default()
            },
        );

        let report = replayer.tick(0).await;
        assert_eq!(report.success, 12);
        assert!(cluster.peak_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_run_non_loop_covers_all_ticks_without_trailing_sleep() {
        let cluster = Arc::new(MockCluster::new());
        let pods = pods_on_cluster(&cluster, 2, 3);
        let replayer = Replayer::new(
            cluster.clone(),
            test_keys(),
            pods,
            3,
            ReplaySettings {
                interval: Duration::ZERO,
                ..ReplaySettings::default()
            },
        );

        let (_tx, rx) = broadcast::channel(1);
        let summary = replayer.run(rx).await.unwrap();
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.success, 6);
        assert_eq!(cluster.patches.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_run_with_empty_series_returns_even_in_loop_mode() {
        let cluster = Arc::new(MockCluster::new());
        let replayer = Replayer::new(
            cluster,
            test_keys(),
            vec![ReplayPod {
                namespace: "workload-a".into(),
                name: "pod-0".into(),
                series: Vec::new(),
            }],
            0,
            ReplaySettings {
                interval: Duration::ZERO,
                looped: true,
                ..ReplaySettings::default()
            },
        );
        replayer.cancel();

        let (_tx, rx) = broadcast::channel(1);
        let summary = tokio::time::timeout(Duration::from_secs(1), replayer.run(rx))
            .await
            .expect("run must return, not spin")
            .unwrap();
        assert_eq!(summary.ticks, 0);
    }

    #[tokio::test]
    async fn test_loop_mode_wraps_to_index_zero() {
        let cluster = Arc::new(MockCluster::new());
        let pods = pods_on_cluster(&cluster, 1, 2);
        let replayer = Arc::new(Replayer::new(
            cluster.clone(),
            test_keys(),
            pods,
            2,
            ReplaySettings {
                interval: Duration::ZERO,
                looped: true,
                ..ReplaySettings::default()
            },
        ));

        let (_tx, rx) = broadcast::channel(1);
        let runner = {
            let replayer = replayer.clone();
            tokio::spawn(async move { replayer.run(rx).await })
        };
        while cluster.patches.lock().unwrap().len() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        replayer.cancel();
        let summary = runner.await.unwrap().unwrap();
        assert!(summary.ticks >= 5);

        let patches = cluster.patches.lock().unwrap();
        let indices: Vec<&str> = patches
            .iter()
            .take(4)
            .map(|(_, _, annotations)| {
                annotations
                    .get(keys::TIME_INDEX_ANNOTATION)
                    .unwrap()
                    .as_str()
            })
            .collect();
        assert_eq!(indices, ["0", "1", "0", "1"]);
    }

    #[tokio::test]
    async fn test_pods_partition_into_batches() {
        let cluster = Arc::new(MockCluster::with_patch_delay(Duration::from_millis(50)));
        let pods = pods_on_cluster(&cluster, 10, 1);
        let replayer = Replayer::new(
            cluster.clone(),
            test_keys(),
            pods,
            1,
            ReplaySettings {
                max_concurrent: 10,
                batch_size: 3,
                ..ReplaySettings::default()
            },
        );

        let report = replayer.tick(0).await;
        assert_eq!(report.success, 10);
        // Each batch is one worker and pods within it run sequentially, so
        // with permits to spare the peak equals the batch count: 4.
        assert_eq!(cluster.peak_in_flight.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_verify_pods_reports_missing() {
        let cluster = Arc::new(MockCluster::new());
        let mut pods = pods_on_cluster(&cluster, 2, 1);
        pods.push(ReplayPod {
            namespace: "workload-a".into(),
            name: "ghost".into(),
            series: vec![sample(100)],
        });

        let outcome = verify_pods(&*cluster, &pods).await;
        assert_eq!(outcome.found, 2);
        assert_eq!(outcome.missing, vec!["workload-a/ghost".to_string()]);
        assert!(!outcome.ok());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_tick() {
        let cluster = Arc::new(MockCluster::new());
        let pods = pods_on_cluster(&cluster, 1, 10);
        let replayer = Replayer::new(
            cluster,
            test_keys(),
            pods,
            10,
            ReplaySettings {
                interval: Duration::ZERO,
                looped: true,
                ..ReplaySettings::default()
            },
        );
        replayer.cancel();

        let (_tx, rx) = broadcast::channel(1);
        let summary = replayer.run(rx).await.unwrap();
        assert_eq!(summary.ticks, 0);
    }
}
