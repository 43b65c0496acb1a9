//! Emulation configuration
//!
//! Parses and validates the emulation config document: node capacities,
//! namespaces, per-pod time series, annotation-key schema and the PSI
//! aggregation policy. Pure data, loaded once at startup and immutable
//! afterwards.

use crate::error::{EmulatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// How per-pod PSI values combine into a node-level value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsiAggregation {
    #[default]
    Sum,
    Max,
    Avg,
}

/// One time point of a pod's replayed series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub cpu: i64,
    pub memory: i64,
    pub power: f64,
    pub psi: f64,
}

/// One time point of the optional real-node series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealNodeSample {
    #[serde(default)]
    pub node_cpu_load: f64,
    #[serde(default)]
    pub node_memory: f64,
    #[serde(default)]
    pub node_power: f64,
    #[serde(default)]
    pub node_psi: f64,
}

/// A pod and its positional time series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEntry {
    pub namespace: String,
    pub pod_name: String,
    pub time_series: Vec<MetricSample>,
}

/// Node entry as written in the config (Kubernetes quantity strings)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub cpu: String,
    pub memory: String,
}

/// Node placement mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NodeConfig {
    Single { single_node: NodeEntry },
    PerNamespace {
        per_namespace_nodes: HashMap<String, NodeEntry>,
    },
}

/// Annotation keys used as the telemetry transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationKeys {
    pub cpu: String,
    pub memory: String,
    pub power: String,
    pub psi: String,
    pub timestamp: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self {
            cpu: "emulation.metrics.k8s.io/cpu".to_string(),
            memory: "emulation.metrics.k8s.io/memory".to_string(),
            power: "emulation.metrics.k8s.io/power".to_string(),
            psi: "emulation.metrics.k8s.io/psi".to_string(),
            timestamp: "emulation.metrics.k8s.io/timestamp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulationSettings {
    pub annotation_keys: AnnotationKeys,
    #[serde(default)]
    pub psi_aggregation: PsiAggregation,
    /// When true (default) the real-node series is indexed by the replayed
    /// time index; when false it advances with the collector's own cycle
    /// counter instead.
    #[serde(default = "default_real_node_follows_replay")]
    pub real_node_follows_replay: bool,
}

fn default_real_node_follows_replay() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    pub total_pods: usize,
    pub total_namespaces: usize,
    pub time_points: usize,
}

/// Parsed node capacity in canonical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub cpu_millicores: i64,
    pub memory_mi: i64,
}

/// The full emulation configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulationConfig {
    pub metadata: ConfigMetadata,
    pub node_config: NodeConfig,
    pub namespaces: Vec<String>,
    pub pods: Vec<PodEntry>,
    pub emulation: EmulationSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_time_series: Option<Vec<RealNodeSample>>,
}

impl EmulationConfig {
    /// Load and validate a config file. Missing file and malformed JSON are
    /// distinct fatal errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EmulatorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: EmulationConfig = serde_json::from_str(&raw).map_err(|e| {
            EmulatorError::Config(format!("invalid JSON in {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation of the loaded document.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.time_points == 0 {
            return Err(EmulatorError::Config("time_points must be >= 1".into()));
        }

        let namespaces: HashSet<&str> = self.namespaces.iter().map(String::as_str).collect();
        for pod in &self.pods {
            if !namespaces.contains(pod.namespace.as_str()) {
                return Err(EmulatorError::Config(format!(
                    "pod '{}/{}' references unknown namespace",
                    pod.namespace, pod.pod_name
                )));
            }
            if pod.time_series.is_empty() {
                return Err(EmulatorError::Config(format!(
                    "pod '{}/{}' has an empty time series",
                    pod.namespace, pod.pod_name
                )));
            }
        }

        if let NodeConfig::PerNamespace { per_namespace_nodes } = &self.node_config {
            for ns in &self.namespaces {
                if !per_namespace_nodes.contains_key(ns) {
                    return Err(EmulatorError::Config(format!(
                        "namespace '{}' has no node mapping",
                        ns
                    )));
                }
            }
        }

        // Capacity strings must parse up front, not at collection time.
        self.node_capacities()?;
        Ok(())
    }

    /// Node capacities keyed by node name, in millicores / Mi.
    pub fn node_capacities(&self) -> Result<HashMap<String, NodeCapacity>> {
        let mut capacities = HashMap::new();
        let entries: Vec<&NodeEntry> = match &self.node_config {
            NodeConfig::Single { single_node } => vec![single_node],
            NodeConfig::PerNamespace { per_namespace_nodes } => {
                per_namespace_nodes.values().collect()
            }
        };
        for node in entries {
            capacities.insert(
                node.name.clone(),
                NodeCapacity {
                    cpu_millicores: parse_cpu(&node.cpu)?,
                    memory_mi: parse_memory(&node.memory)?,
                },
            );
        }
        Ok(capacities)
    }

    /// Which node a namespace's pods are placed on.
    pub fn node_for_namespace(&self, namespace: &str) -> Result<&NodeEntry> {
        match &self.node_config {
            NodeConfig::Single { single_node } => Ok(single_node),
            NodeConfig::PerNamespace { per_namespace_nodes } => per_namespace_nodes
                .get(namespace)
                .ok_or_else(|| {
                    EmulatorError::Config(format!("namespace '{}' has no node mapping", namespace))
                }),
        }
    }

    /// All node entries in the config.
    pub fn node_entries(&self) -> Vec<&NodeEntry> {
        match &self.node_config {
            NodeConfig::Single { single_node } => vec![single_node],
            NodeConfig::PerNamespace { per_namespace_nodes } => {
                let mut entries: Vec<&NodeEntry> = per_namespace_nodes.values().collect();
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                entries
            }
        }
    }

    /// Name of the node whose capacity scales the real-node series. Only the
    /// single-node mode carries one.
    pub fn real_node_name(&self) -> Option<&str> {
        match &self.node_config {
            NodeConfig::Single { single_node } => Some(&single_node.name),
            NodeConfig::PerNamespace { .. } => None,
        }
    }
}

/// Parse a Kubernetes CPU quantity ("16" cores or "16000m") to millicores.
pub fn parse_cpu(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let parsed = if let Some(millis) = raw.strip_suffix('m') {
        millis.parse::<i64>().ok()
    } else {
        raw.parse::<i64>().ok().map(|cores| cores * 1000)
    };
    parsed.ok_or_else(|| EmulatorError::Config(format!("invalid cpu quantity '{}'", raw)))
}

/// Parse a Kubernetes memory quantity ("64Gi", "61440Mi", "64G", "61440M" or
/// plain Mi) to Mi.
pub fn parse_memory(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let parsed = if let Some(v) = raw.strip_suffix("Gi") {
        v.parse::<i64>().ok().map(|g| g * 1024)
    } else if let Some(v) = raw.strip_suffix("Mi") {
        v.parse::<i64>().ok()
    } else if let Some(v) = raw.strip_suffix('G') {
        v.parse::<i64>().ok().map(|g| g * 1024)
    } else if let Some(v) = raw.strip_suffix('M') {
        v.parse::<i64>().ok()
    } else {
        raw.parse::<i64>().ok()
    };
    parsed.ok_or_else(|| EmulatorError::Config(format!("invalid memory quantity '{}'", raw)))
}
