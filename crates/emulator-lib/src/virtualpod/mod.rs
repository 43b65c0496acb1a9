//! Virtual pod pair lifecycle
//!
//! A virtual pod pair simulates cross-node traffic: a placeholder "source"
//! pod on one execution target and a "destination" pod on another, with only
//! the destination carrying live replayed metrics from a private background
//! replayer. Creation is a seven-step pipeline behind a rollback ledger:
//! every committed step records its undo, and any later failure unwinds the
//! ledger in strict reverse order, so a failed creation leaves zero residual
//! remote resources and writes no registry record.

pub mod registry;

use crate::cluster::{keys, ClusterOps, PodManifest};
use crate::config::{AnnotationKeys, MetricSample};
use crate::error::{EmulatorError, Result};
use crate::models::{VirtualPodRecord, VirtualPodStatus};
use async_trait::async_trait;
use chrono::Utc;
use registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// External workload input: `{"time_series":[...]}`
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkloadFile {
    pub time_series: Vec<MetricSample>,
}

impl WorkloadFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EmulatorError::Lifecycle {
                step: 1,
                description: "load workload series",
                message: format!("cannot read {}: {}", path.display(), e),
            }
        })?;
        let workload: WorkloadFile =
            serde_json::from_str(&raw).map_err(|e| EmulatorError::Lifecycle {
                step: 1,
                description: "load workload series",
                message: format!("malformed workload {}: {}", path.display(), e),
            })?;
        if workload.time_series.is_empty() {
            return Err(EmulatorError::Lifecycle {
                step: 1,
                description: "load workload series",
                message: format!("workload {} has an empty time series", path.display()),
            });
        }
        Ok(workload)
    }
}

/// Self-contained replay artifact written next to the destination pod: the
/// background replayer needs only this file to know what to patch.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayArtifact {
    pub namespace: String,
    pub pod: String,
    pub time_series: Vec<MetricSample>,
}

/// One execution target (a node and the means to run things on it)
#[async_trait]
pub trait NodeTarget: Send + Sync {
    /// Logical node name as recorded in the registry.
    fn name(&self) -> &str;

    async fn ensure_namespace(&self, name: &str) -> Result<()>;
    async fn create_pod(&self, manifest: &PodManifest) -> Result<()>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Persist the replay artifact; returns the path the replayer is bound
    /// to.
    async fn write_series_file(&self, id: &str, artifact: &ReplayArtifact) -> Result<PathBuf>;
    async fn remove_series_file(&self, path: &Path) -> Result<()>;

    /// Start a detached background replayer bound to `series_file`. The
    /// returned pid is the handle stored in the registry.
    async fn start_replayer(&self, series_file: &Path, interval: u64) -> Result<u32>;
    async fn stop_replayer(&self, pid: u32) -> Result<()>;
}

/// Committed step with its undo, unwound in reverse on failure
enum UndoStep {
    SourcePod { name: String },
    DestPod { name: String },
    Artifact { path: PathBuf },
    Replayer { pid: u32 },
}

pub struct VirtualPodSettings {
    /// Shared KWOK node both pods are scheduled onto
    pub kwok_node: String,
    pub annotation_keys: AnnotationKeys,
}

pub struct VirtualPodManager {
    source: Arc<dyn NodeTarget>,
    dest: Arc<dyn NodeTarget>,
    registry: Registry,
    settings: VirtualPodSettings,
}

impl VirtualPodManager {
    pub fn new(
        source: Arc<dyn NodeTarget>,
        dest: Arc<dyn NodeTarget>,
        registry: Registry,
        settings: VirtualPodSettings,
    ) -> Self {
        Self {
            source,
            dest,
            registry,
            settings,
        }
    }

    /// Create a virtual pod pair from a workload file. Only after the final
    /// registry append is the pair durably running.
    pub async fn create(
        &self,
        workload_file: &Path,
        interval: u64,
    ) -> Result<VirtualPodRecord> {
        // Step 1: load the workload series.
        let workload = WorkloadFile::load(workload_file)?;

        let id = self.registry.next_id()?;
        let suffix = id.trim_start_matches("vp-");
        let source_pod = format!("virtual-pod-{}-source", suffix);
        let dest_pod = format!("virtual-pod-{}-dest", suffix);
        let namespace = keys::VIRTUAL_POD_NAMESPACE;
        info!(id = %id, source = %self.source.name(), dest = %self.dest.name(), "creating virtual pod pair");

        let mut ledger: Vec<UndoStep> = Vec::new();

        let result = self
            .create_steps(
                &id,
                namespace,
                &source_pod,
                &dest_pod,
                workload_file,
                &workload,
                interval,
                &mut ledger,
            )
            .await;

        match result {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(id = %id, error = %e, "virtual pod creation failed, rolling back");
                self.rollback(namespace, ledger).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_steps(
        &self,
        id: &str,
        namespace: &str,
        source_pod: &str,
        dest_pod: &str,
        workload_file: &Path,
        workload: &WorkloadFile,
        interval: u64,
        ledger: &mut Vec<UndoStep>,
    ) -> Result<VirtualPodRecord> {
        // Step 2: the shared namespace on both targets. Namespaces are
        // shared across pairs and never rolled back.
        self.source
            .ensure_namespace(namespace)
            .await
            .map_err(|e| step_error(2, "ensure namespace on source", e))?;
        self.dest
            .ensure_namespace(namespace)
            .await
            .map_err(|e| step_error(2, "ensure namespace on destination", e))?;

        // Step 3: placeholder source pod with zeroed metrics.
        let manifest = self.pod_manifest(
            id,
            namespace,
            source_pod,
            "source",
            self.dest.name(),
            dest_pod,
            true,
        );
        self.source
            .create_pod(&manifest)
            .await
            .map_err(|e| step_error(3, "create source pod", e))?;
        ledger.push(UndoStep::SourcePod {
            name: source_pod.to_string(),
        });

        // Step 4: destination pod, the one that carries live metrics.
        let manifest = self.pod_manifest(
            id,
            namespace,
            dest_pod,
            "destination",
            self.source.name(),
            source_pod,
            false,
        );
        self.dest
            .create_pod(&manifest)
            .await
            .map_err(|e| step_error(4, "create destination pod", e))?;
        ledger.push(UndoStep::DestPod {
            name: dest_pod.to_string(),
        });

        // Step 5: the replay artifact on the destination target.
        let artifact = ReplayArtifact {
            namespace: namespace.to_string(),
            pod: dest_pod.to_string(),
            time_series: workload.time_series.clone(),
        };
        let series_file = self
            .dest
            .write_series_file(id, &artifact)
            .await
            .map_err(|e| step_error(5, "write series artifact", e))?;
        ledger.push(UndoStep::Artifact {
            path: series_file.clone(),
        });

        // Step 6: the private background replayer.
        let pid = self
            .dest
            .start_replayer(&series_file, interval)
            .await
            .map_err(|e| step_error(6, "start replayer", e))?;
        ledger.push(UndoStep::Replayer { pid });

        // Step 7: the durable record. This is the commit point.
        let record = VirtualPodRecord {
            id: id.to_string(),
            source_node: self.source.name().to_string(),
            source_pod_name: source_pod.to_string(),
            dest_node: self.dest.name().to_string(),
            dest_pod_name: dest_pod.to_string(),
            namespace: namespace.to_string(),
            kwok_node: self.settings.kwok_node.clone(),
            time_series_file: series_file.display().to_string(),
            workload_file: workload_file.display().to_string(),
            created_at: Utc::now().to_rfc3339(),
            status: VirtualPodStatus::Running,
            replayer_pid: Some(pid),
            interval,
        };
        self.registry
            .add(record.clone())
            .map_err(|e| step_error(7, "append registry record", e))?;
        info!(id = %id, pid, "virtual pod pair running");
        Ok(record)
    }

    async fn rollback(&self, namespace: &str, ledger: Vec<UndoStep>) {
        for step in ledger.into_iter().rev() {
            let outcome = match &step {
                UndoStep::Replayer { pid } => self.dest.stop_replayer(*pid).await,
                UndoStep::Artifact { path } => self.dest.remove_series_file(path).await,
                UndoStep::DestPod { name } => self.dest.delete_pod(namespace, name).await,
                UndoStep::SourcePod { name } => self.source.delete_pod(namespace, name).await,
            };
            if let Err(e) = outcome {
                warn!(error = %e, "rollback step failed");
            }
        }
    }

    /// Delete a pair by id. Every remote step is best effort; the record is
    /// removed at the end regardless, because a registry entry for a
    /// non-existent resource is worse than a repeated delete attempt.
    pub async fn delete(&self, id: &str) -> Result<VirtualPodRecord> {
        let record = self.registry.get(id)?;
        info!(id = %id, "deleting virtual pod pair");

        if let Some(pid) = record.replayer_pid {
            if let Err(e) = self.dest.stop_replayer(pid).await {
                warn!(id = %id, pid, error = %e, "failed to stop replayer");
            }
        }
        if let Err(e) = self
            .dest
            .delete_pod(&record.namespace, &record.dest_pod_name)
            .await
        {
            warn!(id = %id, pod = %record.dest_pod_name, error = %e, "failed to delete destination pod");
        }
        if let Err(e) = self
            .source
            .delete_pod(&record.namespace, &record.source_pod_name)
            .await
        {
            warn!(id = %id, pod = %record.source_pod_name, error = %e, "failed to delete source pod");
        }
        if let Err(e) = self
            .dest
            .remove_series_file(Path::new(&record.time_series_file))
            .await
        {
            warn!(id = %id, error = %e, "failed to remove series artifact");
        }

        self.registry.remove(id)
    }

    pub fn list(&self) -> Result<Vec<VirtualPodRecord>> {
        self.registry.list()
    }

    #[allow(clippy::too_many_arguments)]
    fn pod_manifest(
        &self,
        id: &str,
        namespace: &str,
        name: &str,
        role: &str,
        peer_node: &str,
        peer_pod: &str,
        zero_metrics: bool,
    ) -> PodManifest {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), name.to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(keys::VIRTUAL_POD_ANNOTATION.to_string(), "true".to_string());
        annotations.insert(keys::VIRTUAL_ROLE_ANNOTATION.to_string(), role.to_string());
        annotations.insert(
            keys::VIRTUAL_PEER_NODE_ANNOTATION.to_string(),
            peer_node.to_string(),
        );
        annotations.insert(
            keys::VIRTUAL_PEER_POD_ANNOTATION.to_string(),
            peer_pod.to_string(),
        );
        annotations.insert(keys::VIRTUAL_POD_ID_ANNOTATION.to_string(), id.to_string());
        if zero_metrics {
            let annotation_keys = &self.settings.annotation_keys;
            annotations.insert(annotation_keys.cpu.clone(), "0m".to_string());
            annotations.insert(annotation_keys.memory.clone(), "0Mi".to_string());
            annotations.insert(annotation_keys.power.clone(), "0.0".to_string());
            annotations.insert(annotation_keys.psi.clone(), "0.0".to_string());
        }

        PodManifest {
            namespace: namespace.to_string(),
            name: name.to_string(),
            node: self.settings.kwok_node.clone(),
            labels,
            annotations,
        }
    }
}

fn step_error(step: usize, description: &'static str, source: EmulatorError) -> EmulatorError {
    EmulatorError::Lifecycle {
        step,
        description,
        message: source.to_string(),
    }
}

/// Production `NodeTarget`: a kube-backed control plane, series artifacts
/// under a local data directory and background replay via a detached
/// `emuctl virtual-pod replay` process.
pub struct KubeNodeTarget {
    name: String,
    cluster: Arc<dyn ClusterOps>,
    data_dir: PathBuf,
    emuctl: PathBuf,
}

impl KubeNodeTarget {
    pub fn new(name: impl Into<String>, cluster: Arc<dyn ClusterOps>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            cluster,
            data_dir: data_dir.into(),
            emuctl: PathBuf::from("emuctl"),
        }
    }

    /// Override the replayer binary (defaults to `emuctl` on PATH).
    pub fn with_emuctl(mut self, path: impl Into<PathBuf>) -> Self {
        self.emuctl = path.into();
        self
    }
}

#[async_trait]
impl NodeTarget for KubeNodeTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        if self.cluster.namespace_exists(name).await? {
            return Ok(());
        }
        self.cluster.apply_namespace(name).await
    }

    async fn create_pod(&self, manifest: &PodManifest) -> Result<()> {
        self.cluster.apply_pod(manifest).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.cluster.delete_pod(namespace, name).await
    }

    async fn write_series_file(&self, id: &str, artifact: &ReplayArtifact) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| {
                EmulatorError::Config(format!(
                    "cannot create {}: {}",
                    self.data_dir.display(),
                    e
                ))
            })?;
        let path = self.data_dir.join(format!("{}.json", id));
        let payload = serde_json::to_string_pretty(artifact)
            .map_err(|e| EmulatorError::Config(e.to_string()))?;
        tokio::fs::write(&path, payload).await.map_err(|e| {
            EmulatorError::Config(format!("cannot write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    async fn remove_series_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EmulatorError::Config(format!(
                "cannot remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn start_replayer(&self, series_file: &Path, interval: u64) -> Result<u32> {
        let child = tokio::process::Command::new(&self.emuctl)
            .arg("virtual-pod")
            .arg("replay")
            .arg("--series")
            .arg(series_file)
            .arg("--interval")
            .arg(interval.to_string())
            .arg("--loop")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| EmulatorError::Lifecycle {
                step: 6,
                description: "start replayer",
                message: format!("cannot spawn {}: {}", self.emuctl.display(), e),
            })?;
        child.id().ok_or_else(|| EmulatorError::Lifecycle {
            step: 6,
            description: "start replayer",
            message: "replayer exited before a pid was observed".to_string(),
        })
    }

    async fn stop_replayer(&self, pid: u32) -> Result<()> {
        let status = tokio::process::Command::new("kill")
            .arg(pid.to_string())
            .status()
            .await
            .map_err(|e| EmulatorError::Config(format!("cannot signal pid {}: {}", pid, e)))?;
        if status.success() {
            Ok(())
        } else {
            // Already gone is the common case on repeated deletes.
            Err(EmulatorError::NotFound {
                kind: "replayer process",
                name: pid.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn test_keys() -> AnnotationKeys {
        AnnotationKeys {
            cpu: "emulation.metrics.k8s.io/cpu".into(),
            memory: "emulation.metrics.k8s.io/memory".into(),
            power: "emulation.metrics.k8s.io/power".into(),
            psi: "emulation.metrics.k8s.io/psi".into(),
            timestamp: "emulation.metrics.k8s.io/timestamp".into(),
        }
    }

    /// Scripted target: records every call in order and fails the ones it
    /// was told to.
    #[derive(Default)]
    struct ScriptedTarget {
        name: String,
        calls: Mutex<Vec<String>>,
        fail_create_pod: AtomicBool,
        fail_write_series: AtomicBool,
        fail_start_replayer: AtomicBool,
        next_pid: AtomicU32,
    }

    impl ScriptedTarget {
        fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                next_pid: AtomicU32::new(1000),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl NodeTarget for ScriptedTarget {
        fn name(&self) -> &str {
            &self.name
        }

        async fn ensure_namespace(&self, name: &str) -> Result<()> {
            self.log(format!("ensure-namespace {name}"));
            Ok(())
        }

        async fn create_pod(&self, manifest: &PodManifest) -> Result<()> {
            self.log(format!("create-pod {}", manifest.name));
            if self.fail_create_pod.load(Ordering::SeqCst) {
                return Err(EmulatorError::Resource {
                    kind: "pod",
                    name: manifest.name.clone(),
                    message: "scripted failure".into(),
                });
            }
            Ok(())
        }

        async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
            self.log(format!("delete-pod {name}"));
            Ok(())
        }

        async fn write_series_file(
            &self,
            id: &str,
            _artifact: &ReplayArtifact,
        ) -> Result<PathBuf> {
            self.log(format!("write-series {id}"));
            if self.fail_write_series.load(Ordering::SeqCst) {
                return Err(EmulatorError::Config("scripted failure".into()));
            }
            Ok(PathBuf::from(format!("/data/{id}.json")))
        }

        async fn remove_series_file(&self, path: &Path) -> Result<()> {
            self.log(format!("remove-series {}", path.display()));
            Ok(())
        }

        async fn start_replayer(&self, _series_file: &Path, _interval: u64) -> Result<u32> {
            self.log("start-replayer".to_string());
            if self.fail_start_replayer.load(Ordering::SeqCst) {
                return Err(EmulatorError::Config("scripted failure".into()));
            }
            Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
        }

        async fn stop_replayer(&self, pid: u32) -> Result<()> {
            self.log(format!("stop-replayer {pid}"));
            Ok(())
        }
    }

    struct Fixture {
        source: Arc<ScriptedTarget>,
        dest: Arc<ScriptedTarget>,
        manager: VirtualPodManager,
        workload: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let workload = dir.path().join("workload.json");
        std::fs::write(
            &workload,
            r#"{"time_series":[{"cpu":500,"memory":256,"power":12.5,"psi":2.0}]}"#,
        )
        .unwrap();

        let source = Arc::new(ScriptedTarget::named("node-a"));
        let dest = Arc::new(ScriptedTarget::named("node-b"));
        let manager = VirtualPodManager::new(
            source.clone(),
            dest.clone(),
            Registry::new(dir.path().join("registry.json")),
            VirtualPodSettings {
                kwok_node: "virtual-kwok-node".into(),
                annotation_keys: test_keys(),
            },
        );
        Fixture {
            source,
            dest,
            manager,
            workload,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_create_runs_all_steps_and_records() {
        let f = fixture();
        let record = f.manager.create(&f.workload, 60).await.unwrap();

        assert_eq!(record.id, "vp-001");
        assert_eq!(record.source_pod_name, "virtual-pod-001-source");
        assert_eq!(record.dest_pod_name, "virtual-pod-001-dest");
        assert_eq!(record.status, VirtualPodStatus::Running);
        assert_eq!(record.replayer_pid, Some(1000));
        assert_eq!(f.manager.list().unwrap().len(), 1);

        assert_eq!(
            f.source.calls(),
            vec![
                "ensure-namespace virtual-pods",
                "create-pod virtual-pod-001-source"
            ]
        );
        assert_eq!(
            f.dest.calls(),
            vec![
                "ensure-namespace virtual-pods",
                "create-pod virtual-pod-001-dest",
                "write-series vp-001",
                "start-replayer"
            ]
        );
    }

    #[tokio::test]
    async fn test_dest_pod_failure_rolls_back_source_pod() {
        let f = fixture();
        f.dest.fail_create_pod.store(true, Ordering::SeqCst);

        let err = f.manager.create(&f.workload, 60).await.unwrap_err();
        assert!(matches!(err, EmulatorError::Lifecycle { step: 4, .. }));
        assert!(f.manager.list().unwrap().is_empty());
        assert!(f
            .source
            .calls()
            .contains(&"delete-pod virtual-pod-001-source".to_string()));
        // The destination pod never existed, so nothing deletes it.
        assert!(!f.dest.calls().iter().any(|c| c.starts_with("delete-pod")));
    }

    #[tokio::test]
    async fn test_replayer_failure_unwinds_in_reverse() {
        let f = fixture();
        f.dest.fail_start_replayer.store(true, Ordering::SeqCst);

        let err = f.manager.create(&f.workload, 60).await.unwrap_err();
        assert!(matches!(err, EmulatorError::Lifecycle { step: 6, .. }));
        assert!(f.manager.list().unwrap().is_empty());

        let dest_calls = f.dest.calls();
        let artifact = dest_calls
            .iter()
            .position(|c| c.starts_with("remove-series"))
            .unwrap();
        let dest_pod = dest_calls
            .iter()
            .position(|c| c == "delete-pod virtual-pod-001-dest")
            .unwrap();
        assert!(artifact < dest_pod);
        assert!(f
            .source
            .calls()
            .contains(&"delete-pod virtual-pod-001-source".to_string()));
    }

    #[tokio::test]
    async fn test_delete_is_best_effort_and_removes_record() {
        let f = fixture();
        let record = f.manager.create(&f.workload, 60).await.unwrap();

        let removed = f.manager.delete(&record.id).await.unwrap();
        assert_eq!(removed.id, record.id);
        assert!(f.manager.list().unwrap().is_empty());
        assert!(f
            .dest
            .calls()
            .contains(&"stop-replayer 1000".to_string()));
        assert!(f
            .dest
            .calls()
            .contains(&"delete-pod virtual-pod-001-dest".to_string()));
    }

    #[tokio::test]
    async fn test_delete_unknown_id_is_not_found() {
        let f = fixture();
        assert!(f.manager.delete("vp-999").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_ids_advance_across_creates() {
        let f = fixture();
        let first = f.manager.create(&f.workload, 60).await.unwrap();
        let second = f.manager.create(&f.workload, 60).await.unwrap();
        assert_eq!(first.id, "vp-001");
        assert_eq!(second.id, "vp-002");
        assert_eq!(second.dest_pod_name, "virtual-pod-002-dest");
    }

    #[test]
    fn test_workload_file_rejects_empty_series() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, r#"{"time_series":[]}"#).unwrap();
        assert!(WorkloadFile::load(&path).is_err());
    }
}
