//! Conversions between the generated protobuf messages and the domain types
//! in [`crate::types`].

use std::time::SystemTime;

use tonic::{Code, Status};

use crate::error::{CsiError, ErrorCode};
use crate::proto as pb;
use crate::types::*;

use pb::controller_service_capability::rpc::Type as ControllerRpc;
use pb::node_service_capability::rpc::Type as NodeRpc;
use pb::plugin_capability::service::Type as PluginService;
use pb::volume_capability::access_mode::Mode;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

impl From<CsiError> for Status {
    fn from(e: CsiError) -> Self {
        let code = match e.code() {
            ErrorCode::InvalidArgument => Code::InvalidArgument,
            ErrorCode::NotFound => Code::NotFound,
            ErrorCode::FailedPrecondition => Code::FailedPrecondition,
            ErrorCode::Internal => Code::Internal,
            ErrorCode::Unimplemented => Code::Unimplemented,
            ErrorCode::Unavailable => Code::Unavailable,
        };
        Status::new(code, e.to_string())
    }
}

/// Map a status returned by a remote plugin back into a [`CsiError`].
pub fn error_from_status(status: Status) -> CsiError {
    let msg = status.message().to_owned();
    match status.code() {
        Code::InvalidArgument | Code::OutOfRange => CsiError::InvalidArgument(msg),
        Code::NotFound => CsiError::VolumeNotFound(msg),
        Code::FailedPrecondition => CsiError::FailedPrecondition(msg),
        Code::Unimplemented => CsiError::Unimplemented(msg),
        Code::Unavailable => CsiError::TransportError(msg),
        _ => CsiError::Internal(msg),
    }
}

fn bytes_from_wire(value: i64, field: &str) -> Result<u64, CsiError> {
    u64::try_from(value)
        .map_err(|_| CsiError::InvalidArgument(format!("{field} must not be negative: {value}")))
}

fn bytes_to_wire(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, CsiError> {
    if value.is_empty() {
        Err(CsiError::InvalidArgument(format!("{field} is required")))
    } else {
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

impl From<pb::Topology> for Topology {
    fn from(t: pb::Topology) -> Self {
        Self {
            segments: t.segments,
        }
    }
}

impl From<Topology> for pb::Topology {
    fn from(t: Topology) -> Self {
        Self {
            segments: t.segments,
        }
    }
}

impl From<pb::TopologyRequirement> for TopologyRequirement {
    fn from(t: pb::TopologyRequirement) -> Self {
        Self {
            requisite: t.requisite.into_iter().map(Into::into).collect(),
            preferred: t.preferred.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<Mode> for AccessMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Unknown => Self::Unknown,
            Mode::SingleNodeWriter => Self::SingleNodeWriter,
            Mode::SingleNodeReaderOnly => Self::SingleNodeReaderOnly,
            Mode::MultiNodeReaderOnly => Self::MultiNodeReaderOnly,
            Mode::MultiNodeSingleWriter => Self::MultiNodeSingleWriter,
            Mode::MultiNodeMultiWriter => Self::MultiNodeMultiWriter,
            Mode::SingleNodeSingleWriter => Self::SingleNodeSingleWriter,
            Mode::SingleNodeMultiWriter => Self::SingleNodeMultiWriter,
        }
    }
}

impl From<AccessMode> for Mode {
    fn from(m: AccessMode) -> Self {
        match m {
            AccessMode::Unknown => Self::Unknown,
            AccessMode::SingleNodeWriter => Self::SingleNodeWriter,
            AccessMode::SingleNodeReaderOnly => Self::SingleNodeReaderOnly,
            AccessMode::MultiNodeReaderOnly => Self::MultiNodeReaderOnly,
            AccessMode::MultiNodeSingleWriter => Self::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter => Self::MultiNodeMultiWriter,
            AccessMode::SingleNodeSingleWriter => Self::SingleNodeSingleWriter,
            AccessMode::SingleNodeMultiWriter => Self::SingleNodeMultiWriter,
        }
    }
}

impl TryFrom<pb::VolumeCapability> for VolumeCapability {
    type Error = CsiError;

    fn try_from(cap: pb::VolumeCapability) -> Result<Self, CsiError> {
        use pb::volume_capability::AccessType as Pb;

        let access_mode = cap
            .access_mode
            .map(|am| am.mode().into())
            .unwrap_or(AccessMode::Unknown);
        let access_type = match cap.access_type {
            Some(Pb::Block(_)) => AccessType::Block,
            Some(Pb::Mount(m)) => AccessType::Mount {
                fs_type: m.fs_type,
                mount_flags: m.mount_flags,
            },
            None => {
                return Err(CsiError::InvalidArgument(
                    "volume capability has no access type".into(),
                ));
            }
        };
        Ok(Self {
            access_type,
            access_mode,
        })
    }
}

impl From<VolumeCapability> for pb::VolumeCapability {
    fn from(cap: VolumeCapability) -> Self {
        use pb::volume_capability::{AccessMode as PbMode, AccessType as Pb, BlockVolume, MountVolume};

        let access_type = match cap.access_type {
            AccessType::Block => Pb::Block(BlockVolume {}),
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => Pb::Mount(MountVolume {
                fs_type,
                mount_flags,
                volume_mount_group: String::new(),
            }),
        };
        Self {
            access_type: Some(access_type),
            access_mode: Some(PbMode {
                mode: Mode::from(cap.access_mode) as i32,
            }),
        }
    }
}

fn capabilities_from_wire(
    caps: Vec<pb::VolumeCapability>,
) -> Result<Vec<VolumeCapability>, CsiError> {
    caps.into_iter().map(TryInto::try_into).collect()
}

pub fn capabilities_to_wire(caps: Vec<VolumeCapability>) -> Vec<pb::VolumeCapability> {
    caps.into_iter().map(Into::into).collect()
}

impl TryFrom<pb::VolumeContentSource> for VolumeContentSource {
    type Error = CsiError;

    fn try_from(src: pb::VolumeContentSource) -> Result<Self, CsiError> {
        use pb::volume_content_source::Type;

        match src.r#type {
            Some(Type::Snapshot(s)) => Ok(Self::Snapshot(SnapshotId(s.snapshot_id))),
            Some(Type::Volume(v)) => Ok(Self::Volume(VolumeId(v.volume_id))),
            None => Err(CsiError::InvalidArgument(
                "volume content source has no type".into(),
            )),
        }
    }
}

impl From<VolumeContentSource> for pb::VolumeContentSource {
    fn from(src: VolumeContentSource) -> Self {
        use pb::volume_content_source::{SnapshotSource, Type, VolumeSource};

        let r#type = match src {
            VolumeContentSource::Snapshot(id) => Type::Snapshot(SnapshotSource { snapshot_id: id.0 }),
            VolumeContentSource::Volume(id) => Type::Volume(VolumeSource { volume_id: id.0 }),
        };
        Self {
            r#type: Some(r#type),
        }
    }
}

impl From<Volume> for pb::Volume {
    fn from(v: Volume) -> Self {
        Self {
            capacity_bytes: bytes_to_wire(v.capacity_bytes),
            volume_id: v.volume_id.0,
            volume_context: v.volume_context,
            content_source: v.content_source.map(Into::into),
            accessible_topology: v.accessible_topology.into_iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<pb::Volume> for Volume {
    type Error = CsiError;

    fn try_from(v: pb::Volume) -> Result<Self, CsiError> {
        Ok(Self {
            volume_id: VolumeId(v.volume_id),
            capacity_bytes: bytes_from_wire(v.capacity_bytes, "capacity_bytes")?,
            volume_context: v.volume_context,
            content_source: v.content_source.map(TryInto::try_into).transpose()?,
            accessible_topology: v.accessible_topology.into_iter().map(Into::into).collect(),
        })
    }
}

impl From<Snapshot> for pb::Snapshot {
    fn from(s: Snapshot) -> Self {
        Self {
            size_bytes: bytes_to_wire(s.size_bytes),
            snapshot_id: s.snapshot_id.0,
            source_volume_id: s.source_volume_id,
            creation_time: s.creation_time.map(prost_types::Timestamp::from),
            ready_to_use: s.ready_to_use,
            group_snapshot_id: String::new(),
        }
    }
}

impl From<pb::Snapshot> for Snapshot {
    fn from(s: pb::Snapshot) -> Self {
        Self {
            snapshot_id: SnapshotId(s.snapshot_id),
            source_volume_id: s.source_volume_id,
            size_bytes: u64::try_from(s.size_bytes).unwrap_or_default(),
            creation_time: s
                .creation_time
                .and_then(|t| SystemTime::try_from(t).ok()),
            ready_to_use: s.ready_to_use,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller requests
// ---------------------------------------------------------------------------

impl TryFrom<pb::CreateVolumeRequest> for CreateVolumeRequest {
    type Error = CsiError;

    fn try_from(req: pb::CreateVolumeRequest) -> Result<Self, CsiError> {
        let capacity_range = match req.capacity_range {
            Some(r) => Some(CapacityRange {
                required_bytes: bytes_from_wire(r.required_bytes, "required_bytes")?,
                limit_bytes: bytes_from_wire(r.limit_bytes, "limit_bytes")?,
            }),
            None => None,
        };
        Ok(Self {
            name: req.name,
            capacity_range,
            volume_capabilities: capabilities_from_wire(req.volume_capabilities)?,
            parameters: req.parameters,
            content_source: req
                .volume_content_source
                .map(TryInto::try_into)
                .transpose()?,
            accessibility_requirements: req.accessibility_requirements.map(Into::into),
        })
    }
}

impl From<CreateVolumeRequest> for pb::CreateVolumeRequest {
    fn from(req: CreateVolumeRequest) -> Self {
        Self {
            name: req.name,
            capacity_range: req.capacity_range.map(|r| pb::CapacityRange {
                required_bytes: bytes_to_wire(r.required_bytes),
                limit_bytes: bytes_to_wire(r.limit_bytes),
            }),
            volume_capabilities: capabilities_to_wire(req.volume_capabilities),
            parameters: req.parameters,
            volume_content_source: req.content_source.map(Into::into),
            accessibility_requirements: req.accessibility_requirements.map(|t| {
                pb::TopologyRequirement {
                    requisite: t.requisite.into_iter().map(Into::into).collect(),
                    preferred: t.preferred.into_iter().map(Into::into).collect(),
                }
            }),
            ..Default::default()
        }
    }
}

pub fn validate_request(
    req: pb::ValidateVolumeCapabilitiesRequest,
) -> Result<(VolumeId, Vec<VolumeCapability>), CsiError> {
    let id = required(&req.volume_id, "volume_id")?.to_owned();
    Ok((VolumeId(id), capabilities_from_wire(req.volume_capabilities)?))
}

impl From<pb::CreateSnapshotRequest> for CreateSnapshotRequest {
    fn from(req: pb::CreateSnapshotRequest) -> Self {
        Self {
            source_volume_id: req.source_volume_id,
            name: req.name,
            parameters: req.parameters,
        }
    }
}

impl From<pb::ListSnapshotsRequest> for ListSnapshotsRequest {
    fn from(req: pb::ListSnapshotsRequest) -> Self {
        Self {
            snapshot_id: (!req.snapshot_id.is_empty()).then(|| SnapshotId(req.snapshot_id)),
            source_volume_id: (!req.source_volume_id.is_empty())
                .then(|| VolumeId(req.source_volume_id)),
        }
    }
}

pub fn controller_capabilities_to_wire(
    caps: Vec<ControllerCapability>,
) -> Vec<pb::ControllerServiceCapability> {
    use pb::controller_service_capability::{Rpc, Type};

    caps.into_iter()
        .map(|c| {
            let rpc = match c {
                ControllerCapability::CreateDeleteVolume => ControllerRpc::CreateDeleteVolume,
                ControllerCapability::CreateDeleteSnapshot => ControllerRpc::CreateDeleteSnapshot,
                ControllerCapability::ListSnapshots => ControllerRpc::ListSnapshots,
            };
            pb::ControllerServiceCapability {
                r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

fn optional_capability(
    cap: Option<pb::VolumeCapability>,
) -> Result<Option<VolumeCapability>, CsiError> {
    cap.map(TryInto::try_into).transpose()
}

impl TryFrom<pb::NodePublishVolumeRequest> for NodePublishVolumeRequest {
    type Error = CsiError;

    fn try_from(req: pb::NodePublishVolumeRequest) -> Result<Self, CsiError> {
        Ok(Self {
            volume_id: VolumeId(req.volume_id),
            target_path: req.target_path,
            staging_target_path: (!req.staging_target_path.is_empty())
                .then_some(req.staging_target_path),
            volume_capability: optional_capability(req.volume_capability)?,
            read_only: req.readonly,
            volume_context: req.volume_context,
        })
    }
}

impl From<NodePublishVolumeRequest> for pb::NodePublishVolumeRequest {
    fn from(req: NodePublishVolumeRequest) -> Self {
        Self {
            volume_id: req.volume_id.0,
            staging_target_path: req.staging_target_path.unwrap_or_default(),
            target_path: req.target_path,
            volume_capability: req.volume_capability.map(Into::into),
            readonly: req.read_only,
            volume_context: req.volume_context,
            ..Default::default()
        }
    }
}

impl TryFrom<pb::NodeStageVolumeRequest> for NodeStageVolumeRequest {
    type Error = CsiError;

    fn try_from(req: pb::NodeStageVolumeRequest) -> Result<Self, CsiError> {
        Ok(Self {
            volume_id: VolumeId(req.volume_id),
            staging_target_path: req.staging_target_path,
            volume_capability: optional_capability(req.volume_capability)?,
            volume_context: req.volume_context,
        })
    }
}

pub fn stats_to_wire(stats: VolumeStats) -> Vec<pb::VolumeUsage> {
    vec![pb::VolumeUsage {
        available: bytes_to_wire(stats.available_bytes),
        total: bytes_to_wire(stats.total_bytes),
        used: bytes_to_wire(stats.used_bytes),
        unit: pb::volume_usage::Unit::Bytes as i32,
    }]
}

pub fn node_capabilities_to_wire(caps: Vec<NodeCapability>) -> Vec<pb::NodeServiceCapability> {
    use pb::node_service_capability::{Rpc, Type};

    caps.into_iter()
        .map(|c| {
            let rpc = match c {
                NodeCapability::GetVolumeStats => NodeRpc::GetVolumeStats,
            };
            pb::NodeServiceCapability {
                r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
            }
        })
        .collect()
}

impl From<NodeInfo> for pb::NodeGetInfoResponse {
    fn from(info: NodeInfo) -> Self {
        Self {
            node_id: info.node_id,
            max_volumes_per_node: bytes_to_wire(info.max_volumes),
            accessible_topology: info.accessible_topology.map(Into::into),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

pub fn plugin_capabilities_to_wire(caps: Vec<PluginCapability>) -> Vec<pb::PluginCapability> {
    use pb::plugin_capability::{Service, Type};

    caps.into_iter()
        .map(|c| {
            let service = match c {
                PluginCapability::ControllerService => PluginService::ControllerService,
                PluginCapability::VolumeAccessibilityConstraints => {
                    PluginService::VolumeAccessibilityConstraints
                }
            };
            pb::PluginCapability {
                r#type: Some(Type::Service(Service {
                    r#type: service as i32,
                })),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn status_codes_follow_error_class() {
        let status = Status::from(CsiError::VolumeNotFound("vol-1".into()));
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("vol-1"));

        let status = Status::from(CsiError::CommandFailed {
            command: "mount".into(),
            output: "boom".into(),
        });
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(
            Status::from(CsiError::Unimplemented("x".into())).code(),
            Code::Unimplemented
        );
    }

    #[test]
    fn create_request_from_wire() {
        let req = pb::CreateVolumeRequest {
            name: "pvc-1".into(),
            capacity_range: Some(pb::CapacityRange {
                required_bytes: 4096,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::mount("ext4").into()],
            volume_content_source: Some(
                VolumeContentSource::Snapshot(SnapshotId::from("snap-1")).into(),
            ),
            accessibility_requirements: Some(pb::TopologyRequirement {
                requisite: vec![],
                preferred: vec![pb::Topology {
                    segments: HashMap::from([("k".into(), "v".into())]),
                }],
            }),
            ..Default::default()
        };

        let parsed = CreateVolumeRequest::try_from(req).unwrap();
        assert_eq!(parsed.capacity_range.unwrap().required_bytes, 4096);
        assert_eq!(parsed.volume_capabilities[0].fs_type(), Some("ext4"));
        assert_eq!(
            parsed.content_source,
            Some(VolumeContentSource::Snapshot(SnapshotId::from("snap-1")))
        );
        assert_eq!(
            parsed.accessibility_requirements.unwrap().preferred,
            vec![Topology::single("k", "v")]
        );
    }

    #[test]
    fn negative_sizes_are_rejected() {
        let req = pb::CreateVolumeRequest {
            name: "pvc-1".into(),
            capacity_range: Some(pb::CapacityRange {
                required_bytes: -1,
                limit_bytes: 0,
            }),
            ..Default::default()
        };
        assert!(matches!(
            CreateVolumeRequest::try_from(req),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn capability_without_access_type_is_invalid() {
        let cap = pb::VolumeCapability {
            access_type: None,
            access_mode: None,
        };
        assert!(VolumeCapability::try_from(cap).is_err());
    }

    #[test]
    fn stats_are_reported_in_bytes() {
        let usage = stats_to_wire(VolumeStats {
            total_bytes: 100,
            available_bytes: 40,
            used_bytes: 60,
        });
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].unit, pb::volume_usage::Unit::Bytes as i32);
        assert_eq!((usage[0].total, usage[0].available), (100, 40));
    }
}
