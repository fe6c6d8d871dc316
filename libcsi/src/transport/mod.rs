//! gRPC transport for the CSI services over a Unix domain socket.
//!
//! [`CsiServer`] exposes [`CsiIdentity`], [`CsiController`] and [`CsiNode`]
//! implementations through the generated tonic services; [`CsiClient`]
//! connects to a plugin socket, as the kubelet and CSI sidecars do.
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

pub mod client;
pub mod convert;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;

use std::path::PathBuf;

use crate::error::CsiError;

/// Socket path of a `unix://` endpoint. A bare absolute path is accepted too.
pub fn socket_path(endpoint: &str) -> Result<PathBuf, CsiError> {
    let path = match endpoint.split_once("://") {
        Some(("unix", rest)) => rest,
        Some((scheme, _)) => {
            return Err(CsiError::InvalidArgument(format!(
                "unsupported endpoint scheme {scheme:?}, expected unix://"
            )));
        }
        None => endpoint,
    };
    if !path.starts_with('/') {
        return Err(CsiError::InvalidArgument(format!(
            "endpoint {endpoint:?} is not an absolute socket path"
        )));
    }
    Ok(PathBuf::from(path))
}
