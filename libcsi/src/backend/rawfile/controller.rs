//! Controller half of the raw-file plugin.
//!
//! Volumes are logical on this side: `CreateVolume` only allocates an id and
//! describes where the node will materialize the backing file. Snapshots are
//! copied by node-pinned jobs on whichever node hosts the source volume.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::cluster::{JobPhase, NodeExecutor, NodeJob, RegistryEntry, VolumeRegistry, run_on_node};
use super::config::{DEFAULT_VOLUME_SIZE, RawfileConfig, TOPOLOGY_HOSTNAME_KEY};
use super::context::RawfileContext;
use super::store::VolumeStore;
use super::usage;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::types::*;

/// [`CsiController`] for raw-file volumes.
pub struct RawfileController {
    config: Arc<RawfileConfig>,
    store: VolumeStore,
    registry: Option<Arc<dyn VolumeRegistry>>,
    executor: Option<Arc<dyn NodeExecutor>>,
}

impl RawfileController {
    pub fn new(config: Arc<RawfileConfig>) -> Self {
        let store = VolumeStore::new(&config.backing_dir);
        Self {
            config,
            store,
            registry: None,
            executor: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn VolumeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    fn registry(&self) -> Result<&Arc<dyn VolumeRegistry>, CsiError> {
        self.registry
            .as_ref()
            .ok_or_else(|| CsiError::FailedPrecondition("no volume registry configured".into()))
    }

    fn executor(&self) -> Result<&Arc<dyn NodeExecutor>, CsiError> {
        self.executor
            .as_ref()
            .ok_or_else(|| CsiError::FailedPrecondition("no node executor configured".into()))
    }

    /// Registry entry for `volume_id` owned by this driver.
    async fn lookup(&self, volume_id: &str) -> Result<RegistryEntry, CsiError> {
        let entry = self.registry()?.get(volume_id).await?;
        if entry.driver_name != self.config.driver_name {
            return Err(CsiError::VolumeNotFound(format!(
                "{volume_id} (owned by driver {})",
                entry.driver_name
            )));
        }
        Ok(entry)
    }

    fn volume_from_entry(entry: RegistryEntry) -> Volume {
        Volume {
            volume_id: VolumeId(entry.volume_handle),
            capacity_bytes: entry.capacity_bytes,
            volume_context: entry.attributes,
            content_source: None,
            accessible_topology: entry
                .node_affinity_hostname
                .map(|host| Topology::single(TOPOLOGY_HOSTNAME_KEY, host))
                .into_iter()
                .collect(),
        }
    }

    fn job(&self, name: String, node: &str, script: String) -> NodeJob {
        NodeJob {
            name,
            node: node.to_owned(),
            script,
            host_path: self.config.backing_dir.clone(),
        }
    }
}

/// First preferred topology, else first requisite.
fn select_topology(req: Option<&TopologyRequirement>) -> Option<Topology> {
    let req = req?;
    req.preferred
        .first()
        .or_else(|| req.requisite.first())
        .cloned()
}

fn volume_id_for(driver: &str, name: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{driver}/{name}").as_bytes());
    format!("vol-{id}")
}

fn snapshot_id_for(source: &str, name: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{source}/{name}").as_bytes());
    format!("snap-{id}")
}

/// Job names must be valid DNS labels, so they are derived from a hash.
fn job_name(kind: &str, parts: &[&str]) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, parts.join("/").as_bytes());
    format!("rawfile-{kind}-{id}")
}

/// Copies land here first and are renamed into place once complete, so an
/// existing snapshot file is always a finished one.
fn partial_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Single-quote `s` for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn validate_capabilities(caps: &[VolumeCapability]) -> Result<(), String> {
    for cap in caps {
        if matches!(cap.access_type, AccessType::Block) {
            return Err("block access is not supported".into());
        }
        if !cap.access_mode.is_single_node() {
            return Err(format!("access mode {:?} is not supported", cap.access_mode));
        }
    }
    Ok(())
}

#[async_trait]
impl CsiController for RawfileController {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        validate_capabilities(&req.volume_capabilities).map_err(CsiError::InvalidArgument)?;

        let size = match req.capacity_range {
            Some(r) if r.required_bytes > 0 => r.required_bytes,
            _ => DEFAULT_VOLUME_SIZE,
        };
        if let Some(limit) = req.capacity_range.map(|r| r.limit_bytes).filter(|l| *l > 0)
            && size > limit
        {
            return Err(CsiError::InvalidArgument(format!(
                "capacity {size} exceeds limit {limit}"
            )));
        }

        let volume_id = volume_id_for(&self.config.driver_name, &req.name);
        let mut context = RawfileContext {
            backing_file: self.store.backing_file_path(&volume_id),
            size: Some(size),
            restore_from_snapshot: None,
            snapshot_file: None,
        };

        match &req.content_source {
            Some(VolumeContentSource::Snapshot(snap)) => {
                context.snapshot_file = Some(self.store.snapshot_path(&snap.0));
                context.restore_from_snapshot = Some(snap.0.clone());
            }
            Some(VolumeContentSource::Volume(src)) => {
                return Err(CsiError::Unimplemented(format!(
                    "cloning from volume {src} is not supported"
                )));
            }
            None => {}
        }

        let topology = select_topology(req.accessibility_requirements.as_ref());
        info!(%volume_id, size, restore = ?context.restore_from_snapshot, "volume allocated");

        Ok(Volume {
            volume_id: VolumeId(volume_id),
            capacity_bytes: size,
            volume_context: context.into_map(),
            content_source: req.content_source,
            accessible_topology: topology.into_iter().collect(),
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        // The backing file is reclaimed by the node-local garbage collector.
        info!(%volume_id, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<Volume, CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        let entry = self.lookup(&volume_id.0).await?;
        Ok(Self::volume_from_entry(entry))
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }
        if self.registry.is_some() {
            self.lookup(&volume_id.0).await?;
        }
        Ok(validate_capabilities(capabilities).is_ok())
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        let Some(registry) = &self.registry else {
            return Ok(Vec::new());
        };
        let volumes = registry
            .list()
            .await?
            .into_iter()
            .filter(|e| e.driver_name == self.config.driver_name)
            .map(Self::volume_from_entry)
            .collect();
        Ok(volumes)
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        if !tokio::fs::try_exists(self.store.dir()).await? {
            return Ok(0);
        }
        Ok(usage::filesystem_stats(self.store.dir())?.available_bytes)
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
        ])
    }

    #[instrument(skip(self, req), fields(source = %req.source_volume_id, name = %req.name))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        if req.source_volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("source volume id is required".into()));
        }
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot name is required".into()));
        }

        let entry = self.lookup(&req.source_volume_id).await?;
        let executor = self.executor()?;
        let node = entry.node_affinity_hostname.clone().ok_or_else(|| {
            CsiError::FailedPrecondition(format!(
                "cannot determine the node hosting volume {}",
                req.source_volume_id
            ))
        })?;

        let snapshot_id = snapshot_id_for(&req.source_volume_id, &req.name);
        let source = entry
            .backing_file()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.store.backing_file_path(&req.source_volume_id));
        let target = self.store.snapshot_path(&snapshot_id);
        let partial = partial_path(&target);
        let (src, dst, tmp) = (
            shell_quote(&source.to_string_lossy()),
            shell_quote(&target.to_string_lossy()),
            shell_quote(&partial.to_string_lossy()),
        );
        let timeouts = self.config.snapshot_timeouts;

        let check = self.job(
            job_name("check", &[&snapshot_id, &node]),
            &node,
            format!("test -f {dst}"),
        );
        let exists = run_on_node(executor.as_ref(), &check, timeouts.poll_interval, timeouts.check)
            .await
            .map(|phase| phase == JobPhase::Succeeded)
            .unwrap_or_else(|e| {
                warn!(%snapshot_id, error = %e, "snapshot existence check failed");
                false
            });

        if exists {
            debug!(%snapshot_id, "snapshot file already present");
        } else {
            let copy = self.job(
                job_name("copy", &[&snapshot_id, &node]),
                &node,
                format!(
                    "rm -f {tmp} && {{ cp --reflink=auto -f {src} {tmp} || cat {src} > {tmp}; }} && mv -f {tmp} {dst}"
                ),
            );
            let phase =
                run_on_node(executor.as_ref(), &copy, timeouts.poll_interval, timeouts.copy)
                    .await?;
            if phase != JobPhase::Succeeded {
                return Err(CsiError::Internal(format!(
                    "snapshot copy job {} failed on node {node}",
                    copy.name
                )));
            }
        }

        info!(%snapshot_id, %node, "snapshot created");
        Ok(Snapshot {
            snapshot_id: SnapshotId(snapshot_id),
            source_volume_id: req.source_volume_id,
            size_bytes: entry.capacity_bytes,
            creation_time: Some(SystemTime::now()),
            ready_to_use: true,
        })
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        if snapshot_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot id is required".into()));
        }
        let Some(executor) = &self.executor else {
            warn!(%snapshot_id, "no node executor configured, skipping snapshot delete");
            return Ok(());
        };
        let nodes = match executor.nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(%snapshot_id, error = %e, "cannot list nodes, skipping snapshot delete");
                return Ok(());
            }
        };

        let target = self.store.snapshot_path(&snapshot_id.0);
        let path = shell_quote(&target.to_string_lossy());
        let tmp = shell_quote(&partial_path(&target).to_string_lossy());
        let timeouts = self.config.snapshot_timeouts;
        for node in nodes {
            let job = self.job(
                job_name("rm", &[&snapshot_id.0, &node]),
                &node,
                format!("rm -f {path} {tmp}"),
            );
            match run_on_node(executor.as_ref(), &job, timeouts.poll_interval, timeouts.check)
                .await
            {
                Ok(JobPhase::Succeeded) => debug!(%snapshot_id, %node, "snapshot removed"),
                Ok(phase) => warn!(%snapshot_id, %node, ?phase, "snapshot delete job failed"),
                Err(e) => warn!(%snapshot_id, %node, error = %e, "snapshot delete failed"),
            }
        }

        info!(%snapshot_id, "snapshot deleted");
        Ok(())
    }

    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Vec<Snapshot>, CsiError> {
        let Some(snapshot_id) = req.snapshot_id.filter(|id| !id.0.is_empty()) else {
            return Ok(Vec::new());
        };
        Ok(vec![Snapshot {
            snapshot_id,
            source_volume_id: req.source_volume_id.map(|v| v.0).unwrap_or_default(),
            size_bytes: 0,
            creation_time: None,
            ready_to_use: true,
        }])
    }
}
