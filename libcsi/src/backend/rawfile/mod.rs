//! Raw-file backend: volumes are sparse files on node-local disk, exposed to
//! Pods through loop devices.
//!
//! # On-disk layout
//!
//! ```text
//! <backing_dir>/
//!   <volume-id>.img      # materialized on first publish
//!   <snapshot-id>.snap   # written by node-pinned copy jobs
//! ```
//!
//! The controller side ([`RawfileController`]) never touches these files
//! directly; the node side ([`RawfileNode`]) owns them, and the
//! [`GarbageCollector`] reclaims files the cluster no longer declares.

pub mod cluster;
pub mod config;
pub mod context;
pub mod controller;
pub mod exec;
pub mod gc;
pub mod identity;
pub mod loopdev;
pub mod node;
pub mod store;
pub mod usage;

pub use cluster::{
    ClusterError, JobPhase, LocalNodeExecutor, NodeExecutor, NodeJob, RegistryEntry,
    StaticRegistry, VolumeRegistry,
};
pub use config::{RawfileConfig, SnapshotTimeouts};
pub use controller::RawfileController;
pub use exec::{CommandExecutor, CommandOutput, HostExecutor};
pub use gc::{GarbageCollector, GcReport};
pub use identity::RawfileIdentity;
pub use node::RawfileNode;
pub use store::VolumeStore;
