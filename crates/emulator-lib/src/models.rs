//! Core data models for the emulator

use serde::{Deserialize, Serialize};

/// Per-pod metrics as parsed from annotations, overwritten each cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodMetricsSnapshot {
    pub namespace: String,
    pub pod: String,
    pub node: String,
    pub cpu_millicores: f64,
    pub cpu_percent: f64,
    pub memory_mi: f64,
    pub memory_percent: f64,
    pub power_watts: f64,
    pub psi_percent: f64,
}

/// Node-level aggregate of the pods placed on it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetricsAggregate {
    pub cpu_millicores: f64,
    pub cpu_percent: f64,
    pub memory_mi: f64,
    pub memory_percent: f64,
    pub power_watts: f64,
    pub psi_percent: f64,
    pub pod_count: usize,
}

/// One cycle's view of the optional real-node series
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RealNodeMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub power_watts: f64,
    pub psi_percent: f64,
}

/// Lifecycle state of a virtual pod pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualPodStatus {
    Running,
    Stopped,
}

/// Durable record of a virtual pod pair, owned exclusively by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualPodRecord {
    pub id: String,
    pub source_node: String,
    pub source_pod_name: String,
    pub dest_node: String,
    pub dest_pod_name: String,
    pub namespace: String,
    pub kwok_node: String,
    pub time_series_file: String,
    pub workload_file: String,
    pub created_at: String,
    pub status: VirtualPodStatus,
    pub replayer_pid: Option<u32>,
    pub interval: u64,
}
