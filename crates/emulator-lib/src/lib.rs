//! Core library for the KWOK workload emulator
//!
//! This crate provides the pieces behind the exporter and `emuctl`:
//! - Emulation topology config parsing and validation
//! - Fake node/namespace/pod reconciliation against a KWOK cluster
//! - Annotation-based metrics collection and Prometheus exposition
//! - Rate-limited time-series replay onto pod annotations
//! - Virtual pod pair lifecycle with a durable registry

pub mod cluster;
pub mod collector;
pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod replay;
pub mod virtualpod;

pub use cluster::{ClusterOps, KubeCluster};
pub use collector::{MetricsCollector, MetricsSnapshot};
pub use config::EmulationConfig;
pub use error::{EmulatorError, Result};
pub use models::*;
pub use observability::EmulatorMetrics;
pub use reconciler::ResourceReconciler;
pub use replay::{ReplaySettings, Replayer};
pub use virtualpod::{registry::Registry, KubeNodeTarget, VirtualPodManager};
