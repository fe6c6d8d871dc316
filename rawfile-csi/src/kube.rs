//! In-cluster Kubernetes API access.
//!
//! [`KubeClient`] backs both cluster collaborators of the driver:
//!
//! - `VolumeRegistry`: PersistentVolumes, with the CSI source and the
//!   `kubernetes.io/hostname` node affinity flattened into a `RegistryEntry`.
//! - `NodeExecutor`: one `busybox` pod per job, pinned with a `nodeSelector`
//!   and mounting the backing directory via `hostPath`.
//!
//! Authentication uses the pod's service account. The token file is re-read
//! on every request since kubelet rotates it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use libcsi::backend::rawfile::{
    ClusterError, JobPhase, NodeExecutor, NodeJob, RegistryEntry, VolumeRegistry,
};
use reqwest::{Certificate, Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const FALLBACK_NAMESPACE: &str = "kube-system";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const JOB_IMAGE: &str = "busybox:latest";
const JOB_VOLUME: &str = "data-dir";
const MANAGED_BY: &str = "rawfile-csi";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct PersistentVolume {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PersistentVolumeSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistentVolumeSpec {
    #[serde(default)]
    capacity: HashMap<String, String>,
    csi: Option<CsiVolumeSource>,
    node_affinity: Option<VolumeNodeAffinity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsiVolumeSource {
    driver: String,
    volume_handle: String,
    #[serde(default)]
    volume_attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct VolumeNodeAffinity {
    required: Option<NodeSelector>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeSelector {
    #[serde(default)]
    node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeSelectorTerm {
    #[serde(default)]
    match_expressions: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Deserialize)]
struct NodeSelectorRequirement {
    key: String,
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
struct PodStatus {
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Node {
    #[serde(default)]
    metadata: ObjectMeta,
}

/// Kubernetes resource quantity (`10Gi`, `500M`, `1073741824`) in bytes.
pub fn parse_quantity(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    };
    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }
    let fractional = number.parse::<f64>().ok()?;
    (fractional >= 0.0).then(|| (fractional * multiplier as f64).ceil() as u64)
}

impl PersistentVolume {
    fn node_hostname(&self) -> Option<String> {
        self.spec
            .node_affinity
            .as_ref()?
            .required
            .as_ref()?
            .node_selector_terms
            .iter()
            .flat_map(|term| &term.match_expressions)
            .find(|req| req.key == HOSTNAME_LABEL)
            .and_then(|req| req.values.first().cloned())
    }

    fn into_entry(self) -> RegistryEntry {
        let capacity_bytes = self
            .spec
            .capacity
            .get("storage")
            .and_then(|q| parse_quantity(q))
            .unwrap_or_default();
        let node_affinity_hostname = self.node_hostname();
        match self.spec.csi {
            Some(csi) => RegistryEntry {
                driver_name: csi.driver,
                volume_handle: csi.volume_handle,
                capacity_bytes,
                node_affinity_hostname,
                attributes: csi.volume_attributes,
            },
            // Not a CSI volume: keep the name so lookups still resolve.
            None => RegistryEntry {
                volume_handle: self.metadata.name,
                capacity_bytes,
                node_affinity_hostname,
                ..Default::default()
            },
        }
    }
}

fn job_phase(pod: &Pod) -> JobPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => JobPhase::Running,
        Some("Succeeded") => JobPhase::Succeeded,
        Some("Failed") => JobPhase::Failed,
        _ => JobPhase::Pending,
    }
}

fn pod_manifest(job: &NodeJob, namespace: &str) -> Value {
    let host_path = job.host_path.display().to_string();
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": job.name,
            "namespace": namespace,
            "labels": { "app.kubernetes.io/managed-by": MANAGED_BY },
        },
        "spec": {
            "nodeSelector": { HOSTNAME_LABEL: job.node },
            "restartPolicy": "Never",
            "tolerations": [{ "operator": "Exists" }],
            "containers": [{
                "name": "job",
                "image": JOB_IMAGE,
                "command": ["/bin/sh", "-c"],
                "args": [job.script],
                "volumeMounts": [{ "name": JOB_VOLUME, "mountPath": host_path }],
            }],
            "volumes": [{
                "name": JOB_VOLUME,
                "hostPath": { "path": host_path, "type": "DirectoryOrCreate" },
            }],
        },
    })
}

/// Service-account authenticated client for the API server.
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: Client,
    base_url: String,
    token_path: PathBuf,
    namespace: String,
}

impl KubeClient {
    /// Configure from the in-cluster environment: `KUBERNETES_SERVICE_HOST`,
    /// `KUBERNETES_SERVICE_PORT` and the mounted service account.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set; not running in a cluster?")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let base_url = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let ca = std::fs::read(sa.join("ca.crt")).context("failed to read service account CA")?;
        let http = Client::builder()
            .add_root_certificate(Certificate::from_pem(&ca).context("malformed cluster CA")?)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to construct Kubernetes HTTP client")?;
        let namespace = std::fs::read_to_string(sa.join("namespace"))
            .map(|ns| ns.trim().to_owned())
            .ok()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| FALLBACK_NAMESPACE.to_owned());

        Ok(Self {
            http,
            base_url,
            token_path: sa.join("token"),
            namespace,
        })
    }

    /// Namespace the node jobs are created in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        resource: &str,
    ) -> Result<reqwest::Response, ClusterError> {
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| ClusterError::Unavailable(format!("read service account token: {e}")))?;
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(token.trim());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ClusterError::Unavailable(format!("{path}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(ClusterError::NotFound(resource.to_owned())),
            StatusCode::CONFLICT => Err(ClusterError::AlreadyExists(resource.to_owned())),
            _ => {
                let text = response.text().await.unwrap_or_default();
                Err(ClusterError::Unavailable(format!("{path}: {status}: {text}")))
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        resource: &str,
    ) -> Result<T, ClusterError> {
        self.send(Method::GET, path, None, resource)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ClusterError::Unavailable(format!("decode {path}: {e}")))
    }

    fn pod_path(&self, name: &str) -> String {
        format!("/api/v1/namespaces/{}/pods/{name}", self.namespace)
    }
}

#[async_trait]
impl VolumeRegistry for KubeClient {
    #[instrument(skip(self))]
    async fn get(&self, volume_id: &str) -> Result<RegistryEntry, ClusterError> {
        let path = format!("/api/v1/persistentvolumes/{volume_id}");
        match self.get_json::<PersistentVolume>(&path, volume_id).await {
            Ok(pv) => Ok(pv.into_entry()),
            // PVs named differently from their handle are still found.
            Err(ClusterError::NotFound(_)) => self
                .list()
                .await?
                .into_iter()
                .find(|entry| entry.volume_handle == volume_id)
                .ok_or_else(|| ClusterError::NotFound(volume_id.to_owned())),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<RegistryEntry>, ClusterError> {
        let pvs: List<PersistentVolume> = self
            .get_json("/api/v1/persistentvolumes", "persistentvolumes")
            .await?;
        Ok(pvs.items.into_iter().map(PersistentVolume::into_entry).collect())
    }
}

#[async_trait]
impl NodeExecutor for KubeClient {
    #[instrument(skip(self, job), fields(job = %job.name, node = %job.node))]
    async fn launch(&self, job: &NodeJob) -> Result<(), ClusterError> {
        let manifest = pod_manifest(job, &self.namespace);
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        self.send(Method::POST, &path, Some(&manifest), &job.name)
            .await?;
        debug!("job pod created");
        Ok(())
    }

    async fn phase(&self, name: &str) -> Result<JobPhase, ClusterError> {
        let pod: Pod = self.get_json(&self.pod_path(name), name).await?;
        Ok(job_phase(&pod))
    }

    async fn cleanup(&self, name: &str) -> Result<(), ClusterError> {
        match self
            .send(Method::DELETE, &self.pod_path(name), None, name)
            .await
        {
            Ok(_) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn nodes(&self) -> Result<Vec<String>, ClusterError> {
        let nodes: List<Node> = self.get_json("/api/v1/nodes", "nodes").await?;
        Ok(nodes
            .items
            .into_iter()
            .map(|n| n.metadata.name)
            .filter(|n| !n.is_empty())
            .collect())
    }
}
