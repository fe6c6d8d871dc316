//! CSI Controller service trait.
//!
//! The Controller service manages the logical volume lifecycle: identifier
//! allocation, size defaults, topology assignment and snapshot orchestration.
//! It never assumes a volume's backing data exists on the node it runs on.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateSnapshotRequest, CreateVolumeRequest, ListSnapshotsRequest,
    Snapshot, SnapshotId, Volume, VolumeCapability, VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Look up a single volume.
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<Volume, CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    /// Controller RPCs this implementation supports.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    /// Snapshot a volume.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot. Succeeds when the snapshot is already gone.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    /// List snapshots matching the request filters.
    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Vec<Snapshot>, CsiError>;

    /// Attach a volume to a node at the controller level.
    async fn publish_volume(&self, _volume_id: &VolumeId, _node_id: &str) -> Result<(), CsiError> {
        Ok(())
    }

    /// Detach a volume from a node at the controller level.
    async fn unpublish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Ok(())
    }

    /// Grow a volume. Returns the new capacity in bytes.
    async fn expand_volume(&self, _volume_id: &VolumeId, _bytes: u64) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented("ControllerExpandVolume".into()))
    }

    /// Change mutable volume parameters.
    async fn modify_volume(&self, _volume_id: &VolumeId) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("ControllerModifyVolume".into()))
    }
}
