//! Cluster collaborators consumed by the controller and the garbage collector.
//!
//! [`VolumeRegistry`] is the source of truth for which volumes exist;
//! [`NodeExecutor`] runs short-lived, node-pinned jobs against a node's
//! backing directory. The binary wires both to the Kubernetes API; the
//! in-process implementations here serve standalone deployments and tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::context::KEY_BACKING_FILE;
use crate::error::CsiError;

/// Failure talking to a cluster collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl From<ClusterError> for CsiError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(what) => CsiError::VolumeNotFound(what),
            other => CsiError::BackendError(other.to_string()),
        }
    }
}

/// The cluster's declared record of a provisioned volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryEntry {
    pub driver_name: String,
    pub volume_handle: String,
    pub capacity_bytes: u64,
    /// Hostname from the volume's node affinity, when pinned.
    pub node_affinity_hostname: Option<String>,
    pub attributes: HashMap<String, String>,
}

impl RegistryEntry {
    /// Backing-file path recorded in the volume attributes.
    pub fn backing_file(&self) -> Option<&str> {
        self.attributes
            .get(KEY_BACKING_FILE)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Read access to the cluster's volume records.
#[async_trait]
pub trait VolumeRegistry: Send + Sync {
    /// Entry whose volume handle or name equals `volume_id`.
    async fn get(&self, volume_id: &str) -> Result<RegistryEntry, ClusterError>;

    /// Every entry, regardless of driver.
    async fn list(&self) -> Result<Vec<RegistryEntry>, ClusterError>;
}

/// Lifecycle phase of a node-pinned job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A shell command to run on one node with the backing directory mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeJob {
    /// Deterministic name; relaunching the same job is a no-op.
    pub name: String,
    pub node: String,
    /// Script passed to `sh -c`.
    pub script: String,
    /// Host directory made available to the job at the same path.
    pub host_path: PathBuf,
}

/// Runs [`NodeJob`]s on specific cluster nodes.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Start a job. Returns [`ClusterError::AlreadyExists`] if a job with the
    /// same name is already known.
    async fn launch(&self, job: &NodeJob) -> Result<(), ClusterError>;

    async fn phase(&self, name: &str) -> Result<JobPhase, ClusterError>;

    /// Forget a finished job. Missing jobs are not an error.
    async fn cleanup(&self, name: &str) -> Result<(), ClusterError>;

    /// Names of all schedulable nodes.
    async fn nodes(&self) -> Result<Vec<String>, ClusterError>;
}

/// Launch `job`, poll until it finishes or `timeout` elapses, then clean up.
///
/// An already existing job is adopted rather than treated as a failure.
pub async fn run_on_node(
    executor: &dyn NodeExecutor,
    job: &NodeJob,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<JobPhase, CsiError> {
    match executor.launch(job).await {
        Ok(()) => {}
        Err(ClusterError::AlreadyExists(_)) => {
            debug!(job = %job.name, "job already exists, adopting it");
        }
        Err(e) => return Err(CsiError::Internal(format!("launch {}: {e}", job.name))),
    }

    let waited = tokio::time::timeout(timeout, async {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            match executor.phase(&job.name).await {
                Ok(phase) if phase.is_terminal() => return Ok(phase),
                Ok(_) => {}
                Err(e) => return Err(CsiError::Internal(format!("poll {}: {e}", job.name))),
            }
        }
    })
    .await;

    if let Err(e) = executor.cleanup(&job.name).await {
        warn!(job = %job.name, error = %e, "failed to clean up job");
    }

    match waited {
        Ok(res) => res,
        Err(_) => Err(CsiError::Internal(format!(
            "job {} on node {} did not finish within {timeout:?}",
            job.name, job.node
        ))),
    }
}

// ---------------------------------------------------------------------------
// In-process implementations
// ---------------------------------------------------------------------------

/// In-memory [`VolumeRegistry`].
#[derive(Debug, Default)]
pub struct StaticRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: RegistryEntry) {
        self.entries.insert(entry.volume_handle.clone(), entry);
    }

    pub fn remove(&self, volume_handle: &str) {
        self.entries.remove(volume_handle);
    }
}

#[async_trait]
impl VolumeRegistry for StaticRegistry {
    async fn get(&self, volume_id: &str) -> Result<RegistryEntry, ClusterError> {
        self.entries
            .get(volume_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::NotFound(volume_id.to_owned()))
    }

    async fn list(&self) -> Result<Vec<RegistryEntry>, ClusterError> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }
}

/// [`NodeExecutor`] that runs jobs on this host only.
///
/// Jobs addressed to another node fail with [`ClusterError::Unavailable`].
pub struct LocalNodeExecutor {
    node_id: String,
    jobs: Arc<DashMap<String, JobPhase>>,
}

impl LocalNodeExecutor {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            jobs: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl NodeExecutor for LocalNodeExecutor {
    async fn launch(&self, job: &NodeJob) -> Result<(), ClusterError> {
        if job.node != self.node_id {
            return Err(ClusterError::Unavailable(format!(
                "node {} is not reachable from {}",
                job.node, self.node_id
            )));
        }
        if self.jobs.contains_key(&job.name) {
            return Err(ClusterError::AlreadyExists(job.name.clone()));
        }
        self.jobs.insert(job.name.clone(), JobPhase::Running);

        let jobs = Arc::clone(&self.jobs);
        let name = job.name.clone();
        let script = job.script.clone();
        tokio::spawn(async move {
            let phase = match tokio::process::Command::new("sh")
                .args(["-c", &script])
                .output()
                .await
            {
                Ok(out) if out.status.success() => JobPhase::Succeeded,
                Ok(out) => {
                    debug!(job = %name, stderr = %String::from_utf8_lossy(&out.stderr), "job failed");
                    JobPhase::Failed
                }
                Err(e) => {
                    warn!(job = %name, error = %e, "failed to spawn job");
                    JobPhase::Failed
                }
            };
            if let Some(mut entry) = jobs.get_mut(&name) {
                *entry = phase;
            }
        });
        Ok(())
    }

    async fn phase(&self, name: &str) -> Result<JobPhase, ClusterError> {
        self.jobs
            .get(name)
            .map(|p| *p)
            .ok_or_else(|| ClusterError::NotFound(name.to_owned()))
    }

    async fn cleanup(&self, name: &str) -> Result<(), ClusterError> {
        self.jobs.remove(name);
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<String>, ClusterError> {
        Ok(vec![self.node_id.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, node: &str, script: &str) -> NodeJob {
        NodeJob {
            name: name.to_owned(),
            node: node.to_owned(),
            script: script.to_owned(),
            host_path: PathBuf::from("/tmp"),
        }
    }

    #[tokio::test]
    async fn static_registry_get_and_list() {
        let reg = StaticRegistry::new();
        reg.insert(RegistryEntry {
            driver_name: "d".into(),
            volume_handle: "vol-1".into(),
            attributes: HashMap::from([(KEY_BACKING_FILE.into(), "/data/vol-1.img".into())]),
            ..Default::default()
        });

        let entry = reg.get("vol-1").await.unwrap();
        assert_eq!(entry.backing_file(), Some("/data/vol-1.img"));
        assert_eq!(reg.list().await.unwrap().len(), 1);
        assert_eq!(
            reg.get("vol-2").await.unwrap_err(),
            ClusterError::NotFound("vol-2".into())
        );
    }

    #[tokio::test]
    async fn local_job_runs_to_completion() {
        let exec = LocalNodeExecutor::new("node-a");
        let phase = run_on_node(
            &exec,
            &job("ok", "node-a", "true"),
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(phase, JobPhase::Succeeded);
        assert!(exec.phase("ok").await.is_err(), "job must be cleaned up");

        let phase = run_on_node(
            &exec,
            &job("bad", "node-a", "exit 1"),
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(phase, JobPhase::Failed);
    }

    #[tokio::test]
    async fn local_executor_rejects_foreign_node() {
        let exec = LocalNodeExecutor::new("node-a");
        let err = exec.launch(&job("x", "node-b", "true")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn slow_job_times_out() {
        let exec = LocalNodeExecutor::new("node-a");
        let err = run_on_node(
            &exec,
            &job("slow", "node-a", "sleep 5"),
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }
}
