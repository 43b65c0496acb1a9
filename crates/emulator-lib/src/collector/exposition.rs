//! Prometheus text exposition for collected snapshots
//!
//! The output is rendered by hand rather than through a registry: gauge
//! series with per-pod label sets come and go as pods do, and the scrape
//! must reflect exactly the last committed snapshot, including dropping
//! series for pods that no longer exist.

use super::MetricsSnapshot;
use std::fmt::Write;

struct Metric {
    name: &'static str,
    help: &'static str,
    /// Format the value with two decimals instead of the shortest form
    two_decimals: bool,
}

const POD_METRICS: &[Metric] = &[
    Metric {
        name: "emulation_pod_cpu_millicores",
        help: "Pod CPU usage in millicores",
        two_decimals: false,
    },
    Metric {
        name: "emulation_pod_cpu_percent",
        help: "Pod CPU usage percentage",
        two_decimals: true,
    },
    Metric {
        name: "emulation_pod_memory_mi",
        help: "Pod memory usage in Mi",
        two_decimals: false,
    },
    Metric {
        name: "emulation_pod_memory_percent",
        help: "Pod memory usage percentage",
        two_decimals: true,
    },
    Metric {
        name: "emulation_pod_power_watts",
        help: "Pod power consumption in watts",
        two_decimals: false,
    },
    Metric {
        name: "emulation_pod_psi_percent",
        help: "Pod PSI in percent",
        two_decimals: false,
    },
];

const NODE_METRICS: &[Metric] = &[
    Metric {
        name: "emulation_node_cpu_percent",
        help: "Node CPU usage percentage",
        two_decimals: true,
    },
    Metric {
        name: "emulation_node_memory_percent",
        help: "Node memory usage percentage",
        two_decimals: true,
    },
    Metric {
        name: "emulation_node_power_watts",
        help: "Node power consumption in watts",
        two_decimals: true,
    },
    Metric {
        name: "emulation_node_psi_percent",
        help: "Node PSI percentage",
        two_decimals: true,
    },
    Metric {
        name: "emulation_node_pod_count",
        help: "Number of pods on node",
        two_decimals: false,
    },
];

const REAL_NODE_METRICS: &[Metric] = &[
    Metric {
        name: "real_node_cpu_percent",
        help: "Real node CPU usage percentage",
        two_decimals: true,
    },
    Metric {
        name: "real_node_power_watts",
        help: "Real node power consumption in watts",
        two_decimals: true,
    },
    Metric {
        name: "real_node_psi_percent",
        help: "Real node PSI percentage",
        two_decimals: true,
    },
    Metric {
        name: "real_node_memory_percent",
        help: "Real node memory usage percentage",
        two_decimals: true,
    },
];

fn header(out: &mut String, metric: &Metric) {
    let _ = writeln!(out, "# HELP {} {}", metric.name, metric.help);
    let _ = writeln!(out, "# TYPE {} gauge", metric.name);
}

fn format_value(value: f64, two_decimals: bool) -> String {
    if two_decimals {
        format!("{value:.2}")
    } else {
        format!("{value}")
    }
}

/// Render a snapshot as Prometheus text exposition. Pod and node metric
/// headers are always present, even with nothing collected; the real-node
/// group appears only when a real-node series is configured. Map iteration
/// order makes the output deterministic, and it always ends with exactly
/// one newline.
pub fn render(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    for metric in POD_METRICS {
        header(&mut out, metric);
        for pod in snapshot.pods.values() {
            let value = match metric.name {
                "emulation_pod_cpu_millicores" => pod.cpu_millicores,
                "emulation_pod_cpu_percent" => pod.cpu_percent,
                "emulation_pod_memory_mi" => pod.memory_mi,
                "emulation_pod_memory_percent" => pod.memory_percent,
                "emulation_pod_power_watts" => pod.power_watts,
                _ => pod.psi_percent,
            };
            let _ = writeln!(
                out,
                "{}{{namespace=\"{}\",pod=\"{}\",node=\"{}\"}} {}",
                metric.name,
                pod.namespace,
                pod.pod,
                pod.node,
                format_value(value, metric.two_decimals)
            );
        }
    }

    for metric in NODE_METRICS {
        header(&mut out, metric);
        for (node, agg) in &snapshot.nodes {
            if metric.name == "emulation_node_pod_count" {
                let _ = writeln!(out, "{}{{node=\"{}\"}} {}", metric.name, node, agg.pod_count);
                continue;
            }
            let value = match metric.name {
                "emulation_node_cpu_percent" => agg.cpu_percent,
                "emulation_node_memory_percent" => agg.memory_percent,
                "emulation_node_power_watts" => agg.power_watts,
                _ => agg.psi_percent,
            };
            let _ = writeln!(
                out,
                "{}{{node=\"{}\"}} {}",
                metric.name,
                node,
                format_value(value, metric.two_decimals)
            );
        }
    }

    if let Some(real) = &snapshot.real_node {
        for metric in REAL_NODE_METRICS {
            header(&mut out, metric);
            for (node, m) in real {
                let value = match metric.name {
                    "real_node_cpu_percent" => m.cpu_percent,
                    "real_node_power_watts" => m.power_watts,
                    "real_node_psi_percent" => m.psi_percent,
                    _ => m.memory_percent,
                };
                let _ = writeln!(
                    out,
                    "{}{{node=\"{}\"}} {}",
                    metric.name,
                    node,
                    format_value(value, metric.two_decimals)
                );
            }
        }
    }

    out
}
