//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`]. Every variant belongs to one CSI status
//! class ([`ErrorCode`]); the gRPC transport turns that class into the
//! matching `tonic::Status` code.

use thiserror::Error;

/// Status class of a [`CsiError`], mirroring the gRPC codes CSI
/// prescribes for each failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
    Unimplemented,
    Unavailable,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Clone)]
pub enum CsiError {
    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The requested snapshot was not found.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation cannot proceed in the current configuration or state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An OS utility (`losetup`, `mkfs.*`, `mount`, ...) exited non-zero.
    ///
    /// `output` carries the tool's combined stdout/stderr verbatim.
    #[error("{command} failed: {output}")]
    CommandFailed {
        /// The command line that was executed.
        command: String,
        /// Combined stdout/stderr of the failed invocation.
        output: String,
    },

    /// The storage backend returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A socket / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The RPC is deliberately not supported by this plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The CSI status class this error is reported as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::VolumeNotFound(_) | Self::SnapshotNotFound(_) => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::Unimplemented(_) => ErrorCode::Unimplemented,
            Self::TransportError(_) => ErrorCode::Unavailable,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::CommandFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<std::io::Error> for CsiError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}
