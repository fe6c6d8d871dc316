//! # libcsi: Container Storage Interface plumbing for RK8s
//!
//! `libcsi` implements the [Container Storage Interface][csi] v1 gRPC
//! surface over a Unix domain socket (via [`tonic`]) and ships the raw-file
//! backend, which provisions volumes as sparse files on node-local disk and
//! exposes them to Pods through loop devices. It follows the RK8s
//! conventions: Tokio async runtime, `tracing` for observability, `thiserror`
//! for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `Snapshot`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume and snapshot lifecycle. |
//! | [`node`] | [`CsiNode`] trait: publish, unpublish, stats. |
//! | [`proto`] | Generated CSI v1 messages and service stubs. |
//! | [`transport`] | gRPC server/client over a Unix socket. |
//! | [`backend`] | Storage backends (raw file + loop device). |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod controller;
pub mod error;
pub mod identity;
pub mod node;
pub mod proto;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use node::CsiNode;
pub use types::*;
