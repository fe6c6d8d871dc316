//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local operations
//! required to make a volume available to Pod containers:
//!
//! 1. **Stage**: optional global preparation step.
//! 2. **Publish**: make the volume available at the Pod's target path.
//! 3. **Unpublish**: reverse publish.
//! 4. **Unstage**: reverse stage.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
    VolumeStats,
};

/// Node service: local attach / mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at a global path.
    ///
    /// This is idempotent: calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume from the staging path. Idempotent.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at the container's target path.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from the container path. Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Filesystem usage of a published volume.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Grow the filesystem of a published volume. Returns the new capacity.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
        bytes: u64,
    ) -> Result<u64, CsiError>;

    /// Node RPCs this implementation supports.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
