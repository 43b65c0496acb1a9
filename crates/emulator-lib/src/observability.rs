//! Process self-metrics
//!
//! Prometheus instrumentation for the emulator's own behavior (cycle and
//! tick latency, error counts). This is deliberately separate from the
//! domain exposition in [`crate::collector::exposition`], which renders the
//! emulated telemetry itself.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Latency buckets for collection cycles and replay ticks (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static GLOBAL_METRICS: OnceLock<EmulatorMetricsInner> = OnceLock::new();

struct EmulatorMetricsInner {
    collection_cycle_seconds: Histogram,
    pods_collected: IntGauge,
    nodes_aggregated: IntGauge,
    collection_errors: IntCounter,
    replay_tick_seconds: Histogram,
    replay_updates: IntCounterVec,
}

impl EmulatorMetricsInner {
    fn new() -> Self {
        Self {
            collection_cycle_seconds: register_histogram!(
                "emulator_collection_cycle_seconds",
                "Time spent collecting one snapshot from pod annotations",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_cycle_seconds"),

            pods_collected: register_int_gauge!(
                "emulator_pods_collected",
                "Pods observed in the last collection cycle"
            )
            .expect("Failed to register pods_collected"),

            nodes_aggregated: register_int_gauge!(
                "emulator_nodes_aggregated",
                "Nodes aggregated in the last collection cycle"
            )
            .expect("Failed to register nodes_aggregated"),

            collection_errors: register_int_counter!(
                "emulator_collection_errors_total",
                "Total collection cycle errors"
            )
            .expect("Failed to register collection_errors"),

            replay_tick_seconds: register_histogram!(
                "emulator_replay_tick_seconds",
                "Time spent applying one replay tick to all pods",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register replay_tick_seconds"),

            replay_updates: register_int_counter_vec!(
                "emulator_replay_updates_total",
                "Pod annotation updates issued by the replayer",
                &["result"]
            )
            .expect("Failed to register replay_updates"),
        }
    }
}

/// Lightweight handle to the global metrics instance; clones share state.
#[derive(Clone)]
pub struct EmulatorMetrics {
    _private: (),
}

impl Default for EmulatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EmulatorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EmulatorMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_collection_cycle(&self, duration_secs: f64) {
        self.inner().collection_cycle_seconds.observe(duration_secs);
    }

    pub fn set_collection_counts(&self, pods: i64, nodes: i64) {
        self.inner().pods_collected.set(pods);
        self.inner().nodes_aggregated.set(nodes);
    }

    pub fn inc_collection_errors(&self) {
        self.inner().collection_errors.inc();
    }

    pub fn observe_replay_tick(&self, duration_secs: f64) {
        self.inner().replay_tick_seconds.observe(duration_secs);
    }

    pub fn add_replay_updates(&self, success: u64, failed: u64) {
        self.inner()
            .replay_updates
            .with_label_values(&["success"])
            .inc_by(success);
        self.inner()
            .replay_updates
            .with_label_values(&["failed"])
            .inc_by(failed);
    }
}
