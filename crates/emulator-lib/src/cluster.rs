//! Control-plane access seam
//!
//! `ClusterOps` is the single trait through which the reconciler, collector,
//! replayer and virtual-pod manager touch the control plane. The production
//! implementation wraps a `kube` client; tests substitute an in-memory mock.
//! Every remote call carries an explicit per-call timeout; a timeout is a
//! recoverable per-call failure, not fatal to the enclosing operation.

use crate::error::{EmulatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, Namespace, Node, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo, Pod,
    PodSpec, ResourceRequirements, Taint, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Reserved label/annotation keys for the emulation transport
pub mod keys {
    /// Label marking a fixed emulation pod
    pub const EMULATION_POD_LABEL: &str = "emulation.k8s.io/pod";
    /// Label marking an emulation (KWOK) node
    pub const EMULATION_NODE_LABEL: &str = "emulation.k8s.io/node";
    /// Annotation marking a virtual pod
    pub const VIRTUAL_POD_ANNOTATION: &str = "emulation.k8s.io/is-virtual";
    /// Annotation carrying a virtual pod's role (source/destination)
    pub const VIRTUAL_ROLE_ANNOTATION: &str = "emulation.k8s.io/role";
    /// Annotation naming the peer execution target of a virtual pod
    pub const VIRTUAL_PEER_NODE_ANNOTATION: &str = "emulation.k8s.io/peer-node";
    /// Annotation naming the peer pod of a virtual pod
    pub const VIRTUAL_PEER_POD_ANNOTATION: &str = "emulation.k8s.io/peer-pod";
    /// Annotation carrying the virtual pod pair's registry id
    pub const VIRTUAL_POD_ID_ANNOTATION: &str = "emulation.k8s.io/virtual-pod-id";
    /// Annotation carrying the current replay tick as a decimal string
    pub const TIME_INDEX_ANNOTATION: &str = "emulation.metrics.k8s.io/time_index";
    /// KWOK scheduling taint; pods need the matching toleration
    pub const KWOK_TAINT_KEY: &str = "kwok.x-k8s.io/node";
    /// Namespace reserved for virtual pod pairs
    pub const VIRTUAL_POD_NAMESPACE: &str = "virtual-pods";
}

/// The pod fields the emulator reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodView {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl PodView {
    pub fn from_pod(pod: Pod) -> Self {
        let node_name = pod.spec.and_then(|spec| spec.node_name);
        Self {
            name: pod.metadata.name.unwrap_or_default(),
            namespace: pod.metadata.namespace.unwrap_or_default(),
            node_name,
            labels: pod.metadata.labels.unwrap_or_default(),
            annotations: pod.metadata.annotations.unwrap_or_default(),
        }
    }

    /// Eligible pods carry the emulation label or the virtual marker.
    pub fn is_emulation_pod(&self) -> bool {
        self.labels.contains_key(keys::EMULATION_POD_LABEL)
    }

    pub fn is_virtual_pod(&self) -> bool {
        self.annotations
            .get(keys::VIRTUAL_POD_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// Desired state of a fake node
#[derive(Debug, Clone)]
pub struct NodeManifest {
    pub name: String,
    /// Kubernetes quantity string, e.g. "16" or "16000m"
    pub cpu: String,
    /// Kubernetes quantity string, e.g. "64Gi"
    pub memory: String,
}

/// Desired state of a fake pod
#[derive(Debug, Clone)]
pub struct PodManifest {
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl PodManifest {
    /// Manifest for a fixed emulation pod from the config topology.
    pub fn emulation(namespace: &str, name: &str, node: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), name.to_string());
        labels.insert(keys::EMULATION_POD_LABEL.to_string(), "true".to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "emulation.k8s.io/source".to_string(),
            "kwok-metrics-emulator".to_string(),
        );
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            node: node.to_string(),
            labels,
            annotations,
        }
    }
}

/// Control-plane operations used across the emulator
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Startup probe; failure is fatal.
    async fn verify_connection(&self) -> Result<()>;

    /// One batch query per namespace. `NotFound` when the namespace does not
    /// exist.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodView>>;

    /// Merge-patch a pod's metadata annotations.
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    async fn apply_node(&self, manifest: &NodeManifest) -> Result<()>;
    async fn apply_namespace(&self, name: &str) -> Result<()>;
    async fn apply_pod(&self, manifest: &PodManifest) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    async fn delete_node(&self, name: &str) -> Result<()>;

    async fn node_exists(&self, name: &str) -> Result<bool>;
    async fn namespace_exists(&self, name: &str) -> Result<bool>;
}

/// `ClusterOps` backed by a `kube` client
pub struct KubeCluster {
    client: Client,
    call_timeout: Duration,
}

impl KubeCluster {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| EmulatorError::RemoteUnavailable(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// Connect using an explicit kubeconfig file.
    pub async fn connect_with_kubeconfig(path: &std::path::Path) -> Result<Self> {
        let kubeconfig = kube::config::Kubeconfig::read_from(path)
            .map_err(|e| EmulatorError::RemoteUnavailable(e.to_string()))?;
        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await
        .map_err(|e| EmulatorError::RemoteUnavailable(e.to_string()))?;
        let client = Client::try_from(config)
            .map_err(|e| EmulatorError::RemoteUnavailable(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self {
            client,
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        kind: &'static str,
        name: &str,
        fut: impl Future<Output = std::result::Result<T, kube::Error>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Err(_) => Err(EmulatorError::Timeout {
                operation: operation.to_string(),
            }),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_kube_error(kind, name, err)),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn verify_connection(&self) -> Result<()> {
        let api = self.namespaces();
        let params = ListParams::default().limit(1);
        match tokio::time::timeout(self.call_timeout, api.list(&params)).await {
            Err(_) => Err(EmulatorError::RemoteUnavailable(
                "connection probe timed out".to_string(),
            )),
            Ok(Err(err)) => Err(EmulatorError::RemoteUnavailable(err.to_string())),
            Ok(Ok(_)) => {
                debug!("control plane connection established");
                Ok(())
            }
        }
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodView>> {
        let api = self.pods(namespace);
        let list = self
            .call(
                "list pods",
                "namespace",
                namespace,
                api.list(&ListParams::default()),
            )
            .await?;
        Ok(list.items.into_iter().map(PodView::from_pod).collect())
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api = self.pods(namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.call(
            "patch pod annotations",
            "pod",
            name,
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }

    async fn apply_node(&self, manifest: &NodeManifest) -> Result<()> {
        let node = build_node(manifest);
        self.call(
            "create node",
            "node",
            &manifest.name,
            self.nodes().create(&PostParams::default(), &node),
        )
        .await?;
        Ok(())
    }

    async fn apply_namespace(&self, name: &str) -> Result<()> {
        let namespace = Namespace {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.call(
            "create namespace",
            "namespace",
            name,
            self.namespaces().create(&PostParams::default(), &namespace),
        )
        .await?;
        Ok(())
    }

    async fn apply_pod(&self, manifest: &PodManifest) -> Result<()> {
        let pod = build_pod(manifest);
        let api = self.pods(&manifest.namespace);
        self.call(
            "create pod",
            "pod",
            &manifest.name,
            api.create(&PostParams::default(), &pod),
        )
        .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.pods(namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.call("delete pod", "pod", name, api.delete(name, &params))
            .await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.call(
            "delete namespace",
            "namespace",
            name,
            self.namespaces().delete(name, &DeleteParams::default()),
        )
        .await?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.call(
            "delete node",
            "node",
            name,
            self.nodes().delete(name, &DeleteParams::default()),
        )
        .await?;
        Ok(())
    }

    async fn node_exists(&self, name: &str) -> Result<bool> {
        let found = self
            .call("get node", "node", name, self.nodes().get_opt(name))
            .await?;
        Ok(found.is_some())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let found = self
            .call(
                "get namespace",
                "namespace",
                name,
                self.namespaces().get_opt(name),
            )
            .await?;
        Ok(found.is_some())
    }
}

fn map_kube_error(kind: &'static str, name: &str, err: kube::Error) -> EmulatorError {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => EmulatorError::NotFound {
            kind,
            name: name.to_string(),
        },
        other => EmulatorError::Resource {
            kind,
            name: name.to_string(),
            message: other.to_string(),
        },
    }
}

/// A fake node ready enough for KWOK to adopt: taint, capacity, and a green
/// set of conditions.
fn build_node(manifest: &NodeManifest) -> Node {
    let mut labels = BTreeMap::new();
    labels.insert("kubernetes.io/arch".to_string(), "amd64".to_string());
    labels.insert("kubernetes.io/os".to_string(), "linux".to_string());
    labels.insert(
        "kubernetes.io/hostname".to_string(),
        manifest.name.clone(),
    );
    labels.insert("type".to_string(), "kwok".to_string());
    labels.insert(keys::EMULATION_NODE_LABEL.to_string(), "true".to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert("node.alpha.kubernetes.io/ttl".to_string(), "0".to_string());
    annotations.insert(keys::KWOK_TAINT_KEY.to_string(), "fake".to_string());

    let mut resources = BTreeMap::new();
    resources.insert("cpu".to_string(), Quantity(manifest.cpu.clone()));
    resources.insert("memory".to_string(), Quantity(manifest.memory.clone()));
    resources.insert("pods".to_string(), Quantity("110".to_string()));

    let conditions = vec![
        node_condition("Ready", "True", "KubeletReady"),
        node_condition("MemoryPressure", "False", "KubeletHasSufficientMemory"),
        node_condition("DiskPressure", "False", "KubeletHasNoDiskPressure"),
        node_condition("PIDPressure", "False", "KubeletHasSufficientPID"),
        node_condition("NetworkUnavailable", "False", "RouteCreated"),
    ];

    Node {
        metadata: kube::api::ObjectMeta {
            name: Some(manifest.name.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: Some(vec![Taint {
                effect: "NoSchedule".to_string(),
                key: keys::KWOK_TAINT_KEY.to_string(),
                value: Some("fake".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            allocatable: Some(resources.clone()),
            capacity: Some(resources),
            conditions: Some(conditions),
            node_info: Some(NodeSystemInfo {
                architecture: "amd64".to_string(),
                container_runtime_version: "kwok".to_string(),
                kube_proxy_version: "fake".to_string(),
                kubelet_version: "fake".to_string(),
                operating_system: "linux".to_string(),
                ..Default::default()
            }),
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

fn node_condition(kind: &str, status: &str, reason: &str) -> NodeCondition {
    NodeCondition {
        type_: kind.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        ..Default::default()
    }
}

/// A fake pod pinned to its node, tolerating the KWOK taint.
fn build_pod(manifest: &PodManifest) -> Pod {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity("100m".to_string()));
    requests.insert("memory".to_string(), Quantity("128Mi".to_string()));
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity("1000m".to_string()));
    limits.insert("memory".to_string(), Quantity("512Mi".to_string()));

    Pod {
        metadata: kube::api::ObjectMeta {
            name: Some(manifest.name.clone()),
            namespace: Some(manifest.namespace.clone()),
            labels: Some(manifest.labels.clone()),
            annotations: Some(manifest.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(manifest.node.clone()),
            tolerations: Some(vec![Toleration {
                key: Some(keys::KWOK_TAINT_KEY.to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: manifest.name.clone(),
                image: Some("fake-image:latest".to_string()),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    limits: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}
