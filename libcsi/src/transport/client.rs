//! gRPC client for a CSI plugin listening on a Unix socket.

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, instrument};

use super::convert::error_from_status;
use super::socket_path;
use crate::error::CsiError;
use crate::proto as pb;
use crate::proto::controller_client::ControllerClient;
use crate::proto::identity_client::IdentityClient;
use crate::proto::node_client::NodeClient;
use crate::types::{
    CreateVolumeRequest, NodePublishVolumeRequest, PluginInfo, Volume, VolumeId, VolumeStats,
};

/// A CSI client bound to one plugin socket.
///
/// The underlying channel is cheap to clone, so the per-service clients
/// returned by [`Self::identity`], [`Self::controller`] and [`Self::node`]
/// share one connection.
#[derive(Clone)]
pub struct CsiClient {
    channel: Channel,
}

impl CsiClient {
    /// Connect to the plugin at `endpoint` (`unix:///path/to/csi.sock`).
    pub async fn connect(endpoint: &str) -> Result<Self, CsiError> {
        let path = socket_path(endpoint)?;
        // The URI is required by tonic but ignored by the connector.
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(CsiError::transport)?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await
            .map_err(CsiError::transport)?;
        debug!(%endpoint, "CSI connection established");
        Ok(Self { channel })
    }

    pub fn identity(&self) -> IdentityClient<Channel> {
        IdentityClient::new(self.channel.clone())
    }

    pub fn controller(&self) -> ControllerClient<Channel> {
        ControllerClient::new(self.channel.clone())
    }

    pub fn node(&self) -> NodeClient<Channel> {
        NodeClient::new(self.channel.clone())
    }

    pub async fn plugin_info(&self) -> Result<PluginInfo, CsiError> {
        let resp = self
            .identity()
            .get_plugin_info(pb::GetPluginInfoRequest {})
            .await
            .map_err(error_from_status)?
            .into_inner();
        Ok(PluginInfo {
            name: resp.name,
            vendor_version: resp.vendor_version,
        })
    }

    pub async fn probe(&self) -> Result<bool, CsiError> {
        let resp = self
            .identity()
            .probe(pb::ProbeRequest {})
            .await
            .map_err(error_from_status)?;
        Ok(resp.into_inner().ready.unwrap_or(false))
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        let resp = self
            .controller()
            .create_volume(pb::CreateVolumeRequest::from(req))
            .await
            .map_err(error_from_status)?
            .into_inner();
        let volume = resp
            .volume
            .ok_or_else(|| CsiError::Internal("CreateVolume response has no volume".into()))?;
        Volume::try_from(volume)
    }

    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.controller()
            .delete_volume(pb::DeleteVolumeRequest {
                volume_id: volume_id.0.clone(),
                ..Default::default()
            })
            .await
            .map_err(error_from_status)?;
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.node()
            .node_publish_volume(pb::NodePublishVolumeRequest::from(req))
            .await
            .map_err(error_from_status)?;
        Ok(())
    }

    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.node()
            .node_unpublish_volume(pb::NodeUnpublishVolumeRequest {
                volume_id: volume_id.0.clone(),
                target_path: target_path.to_owned(),
            })
            .await
            .map_err(error_from_status)?;
        Ok(())
    }

    pub async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        let resp = self
            .node()
            .node_get_volume_stats(pb::NodeGetVolumeStatsRequest {
                volume_id: volume_id.0.clone(),
                volume_path: volume_path.to_owned(),
                staging_target_path: String::new(),
            })
            .await
            .map_err(error_from_status)?
            .into_inner();
        let usage = resp
            .usage
            .into_iter()
            .find(|u| u.unit == pb::volume_usage::Unit::Bytes as i32)
            .ok_or_else(|| CsiError::Internal("no byte usage reported".into()))?;
        Ok(VolumeStats {
            total_bytes: u64::try_from(usage.total).unwrap_or_default(),
            available_bytes: u64::try_from(usage.available).unwrap_or_default(),
            used_bytes: u64::try_from(usage.used).unwrap_or_default(),
        })
    }
}
