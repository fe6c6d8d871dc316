//! gRPC server that runs the plugin's CSI services on a Unix socket.

use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use super::convert::{
    capabilities_to_wire, controller_capabilities_to_wire, node_capabilities_to_wire,
    plugin_capabilities_to_wire, stats_to_wire, validate_request,
};
use super::socket_path;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::proto as pb;
use crate::proto::controller_server::{Controller, ControllerServer};
use crate::proto::identity_server::{Identity, IdentityServer};
use crate::proto::node_server::{Node, NodeServer};
use crate::types::{
    CreateVolumeRequest, NodePublishVolumeRequest, NodeStageVolumeRequest, SnapshotId, VolumeId,
};

/// A CSI plugin server.
///
/// Identity is always served. Controller and Node are registered only when
/// present, so a controller-only or node-only deployment answers the missing
/// service with `UNIMPLEMENTED`.
pub struct CsiServer {
    identity: Arc<dyn CsiIdentity>,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

impl CsiServer {
    pub fn new(identity: Arc<dyn CsiIdentity>) -> Self {
        Self {
            identity,
            controller: None,
            node: None,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn CsiController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn CsiNode>) -> Self {
        self.node = Some(node);
        self
    }

    /// Serve on `endpoint` until `shutdown` is cancelled.
    ///
    /// The socket's parent directory is created and a stale socket file from
    /// a previous run is removed before binding.
    pub async fn serve(self, endpoint: &str, shutdown: CancellationToken) -> Result<(), CsiError> {
        let path = socket_path(endpoint)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path).map_err(CsiError::transport)?;
        info!(
            path = %path.display(),
            controller = self.controller.is_some(),
            node = self.node.is_some(),
            "CSI gRPC server listening",
        );

        let result = tonic::transport::Server::builder()
            .add_service(IdentityServer::new(IdentityService(self.identity)))
            .add_optional_service(
                self.controller
                    .map(|c| ControllerServer::new(ControllerService(c))),
            )
            .add_optional_service(self.node.map(|n| NodeServer::new(NodeService(n))))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
            .map_err(CsiError::transport);

        let _ = tokio::fs::remove_file(&path).await;
        info!("CSI gRPC server stopped");
        result
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

struct IdentityService(Arc<dyn CsiIdentity>);

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<pb::GetPluginInfoRequest>,
    ) -> Result<Response<pb::GetPluginInfoResponse>, Status> {
        let info = self.0.get_plugin_info().await?;
        Ok(Response::new(pb::GetPluginInfoResponse {
            name: info.name,
            vendor_version: info.vendor_version,
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<pb::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<pb::GetPluginCapabilitiesResponse>, Status> {
        let caps = self.0.get_plugin_capabilities().await?;
        Ok(Response::new(pb::GetPluginCapabilitiesResponse {
            capabilities: plugin_capabilities_to_wire(caps),
        }))
    }

    async fn probe(
        &self,
        _request: Request<pb::ProbeRequest>,
    ) -> Result<Response<pb::ProbeResponse>, Status> {
        let ready = self.0.probe().await?;
        Ok(Response::new(pb::ProbeResponse { ready: Some(ready) }))
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct ControllerService(Arc<dyn CsiController>);

fn volume_id(raw: String) -> Result<VolumeId, Status> {
    if raw.is_empty() {
        return Err(Status::invalid_argument("volume_id is required"));
    }
    Ok(VolumeId(raw))
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<pb::CreateVolumeRequest>,
    ) -> Result<Response<pb::CreateVolumeResponse>, Status> {
        let req = CreateVolumeRequest::try_from(request.into_inner())?;
        let volume = self.0.create_volume(req).await?;
        Ok(Response::new(pb::CreateVolumeResponse {
            volume: Some(volume.into()),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<pb::DeleteVolumeRequest>,
    ) -> Result<Response<pb::DeleteVolumeResponse>, Status> {
        let id = volume_id(request.into_inner().volume_id)?;
        self.0.delete_volume(&id).await?;
        Ok(Response::new(pb::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<pb::ControllerPublishVolumeRequest>,
    ) -> Result<Response<pb::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let id = volume_id(req.volume_id)?;
        self.0.publish_volume(&id, &req.node_id).await?;
        Ok(Response::new(pb::ControllerPublishVolumeResponse::default()))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<pb::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<pb::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let id = volume_id(req.volume_id)?;
        self.0.unpublish_volume(&id, &req.node_id).await?;
        Ok(Response::new(pb::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<pb::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<pb::ValidateVolumeCapabilitiesResponse>, Status> {
        use pb::validate_volume_capabilities_response::Confirmed;

        let req = request.into_inner();
        let context = req.volume_context.clone();
        let parameters = req.parameters.clone();
        let (id, caps) = validate_request(req)?;
        let supported = self.0.validate_volume_capabilities(&id, &caps).await?;

        let response = if supported {
            pb::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(Confirmed {
                    volume_context: context,
                    volume_capabilities: capabilities_to_wire(caps),
                    parameters,
                    mutable_parameters: Default::default(),
                }),
                message: String::new(),
            }
        } else {
            pb::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "only single-node mount capabilities are supported".into(),
            }
        };
        Ok(Response::new(response))
    }

    async fn list_volumes(
        &self,
        _request: Request<pb::ListVolumesRequest>,
    ) -> Result<Response<pb::ListVolumesResponse>, Status> {
        use pb::list_volumes_response::Entry;

        let entries = self
            .0
            .list_volumes()
            .await?
            .into_iter()
            .map(|v| Entry {
                volume: Some(v.into()),
                status: None,
            })
            .collect();
        Ok(Response::new(pb::ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<pb::GetCapacityRequest>,
    ) -> Result<Response<pb::GetCapacityResponse>, Status> {
        let available = self.0.get_capacity().await?;
        Ok(Response::new(pb::GetCapacityResponse {
            available_capacity: i64::try_from(available).unwrap_or(i64::MAX),
            ..Default::default()
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<pb::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<pb::ControllerGetCapabilitiesResponse>, Status> {
        let caps = self.0.get_capabilities().await?;
        Ok(Response::new(pb::ControllerGetCapabilitiesResponse {
            capabilities: controller_capabilities_to_wire(caps),
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<pb::CreateSnapshotRequest>,
    ) -> Result<Response<pb::CreateSnapshotResponse>, Status> {
        let snapshot = self.0.create_snapshot(request.into_inner().into()).await?;
        Ok(Response::new(pb::CreateSnapshotResponse {
            snapshot: Some(snapshot.into()),
        }))
    }

    async fn delete_snapshot(
        &self,
        request: Request<pb::DeleteSnapshotRequest>,
    ) -> Result<Response<pb::DeleteSnapshotResponse>, Status> {
        let id = SnapshotId(request.into_inner().snapshot_id);
        self.0.delete_snapshot(&id).await?;
        Ok(Response::new(pb::DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: Request<pb::ListSnapshotsRequest>,
    ) -> Result<Response<pb::ListSnapshotsResponse>, Status> {
        use pb::list_snapshots_response::Entry;

        let entries = self
            .0
            .list_snapshots(request.into_inner().into())
            .await?
            .into_iter()
            .map(|s| Entry {
                snapshot: Some(s.into()),
            })
            .collect();
        Ok(Response::new(pb::ListSnapshotsResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<pb::ControllerExpandVolumeRequest>,
    ) -> Result<Response<pb::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let id = volume_id(req.volume_id)?;
        let bytes = req
            .capacity_range
            .map(|r| u64::try_from(r.required_bytes).unwrap_or_default())
            .unwrap_or_default();
        let capacity = self.0.expand_volume(&id, bytes).await?;
        Ok(Response::new(pb::ControllerExpandVolumeResponse {
            capacity_bytes: i64::try_from(capacity).unwrap_or(i64::MAX),
            node_expansion_required: false,
        }))
    }

    async fn controller_get_volume(
        &self,
        request: Request<pb::ControllerGetVolumeRequest>,
    ) -> Result<Response<pb::ControllerGetVolumeResponse>, Status> {
        let id = volume_id(request.into_inner().volume_id)?;
        let volume = self.0.get_volume(&id).await?;
        Ok(Response::new(pb::ControllerGetVolumeResponse {
            volume: Some(volume.into()),
            status: None,
        }))
    }

    async fn controller_modify_volume(
        &self,
        request: Request<pb::ControllerModifyVolumeRequest>,
    ) -> Result<Response<pb::ControllerModifyVolumeResponse>, Status> {
        let id = volume_id(request.into_inner().volume_id)?;
        self.0.modify_volume(&id).await?;
        Ok(Response::new(pb::ControllerModifyVolumeResponse {}))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct NodeService(Arc<dyn CsiNode>);

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<pb::NodeStageVolumeRequest>,
    ) -> Result<Response<pb::NodeStageVolumeResponse>, Status> {
        let req = NodeStageVolumeRequest::try_from(request.into_inner())?;
        self.0.stage_volume(req).await?;
        Ok(Response::new(pb::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<pb::NodeUnstageVolumeRequest>,
    ) -> Result<Response<pb::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        self.0
            .unstage_volume(&VolumeId(req.volume_id), &req.staging_target_path)
            .await?;
        Ok(Response::new(pb::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<pb::NodePublishVolumeRequest>,
    ) -> Result<Response<pb::NodePublishVolumeResponse>, Status> {
        let req = NodePublishVolumeRequest::try_from(request.into_inner())?;
        self.0.publish_volume(req).await?;
        Ok(Response::new(pb::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<pb::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<pb::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.0
            .unpublish_volume(&VolumeId(req.volume_id), &req.target_path)
            .await?;
        Ok(Response::new(pb::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<pb::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<pb::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        let stats = self
            .0
            .get_volume_stats(&VolumeId(req.volume_id), &req.volume_path)
            .await?;
        Ok(Response::new(pb::NodeGetVolumeStatsResponse {
            usage: stats_to_wire(stats),
            volume_condition: None,
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<pb::NodeExpandVolumeRequest>,
    ) -> Result<Response<pb::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let bytes = req
            .capacity_range
            .map(|r| u64::try_from(r.required_bytes).unwrap_or_default())
            .unwrap_or_default();
        let capacity = self
            .0
            .expand_volume(&VolumeId(req.volume_id), &req.volume_path, bytes)
            .await?;
        Ok(Response::new(pb::NodeExpandVolumeResponse {
            capacity_bytes: i64::try_from(capacity).unwrap_or(i64::MAX),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<pb::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<pb::NodeGetCapabilitiesResponse>, Status> {
        let caps = self.0.get_capabilities().await?;
        Ok(Response::new(pb::NodeGetCapabilitiesResponse {
            capabilities: node_capabilities_to_wire(caps),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<pb::NodeGetInfoRequest>,
    ) -> Result<Response<pb::NodeGetInfoResponse>, Status> {
        let info = self.0.get_info().await?;
        Ok(Response::new(info.into()))
    }
}
