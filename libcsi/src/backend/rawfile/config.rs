//! Runtime configuration for the raw-file backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default driver name registered with the kubelet.
pub const DEFAULT_DRIVER_NAME: &str = "rk8s.rawfile.csi";
/// Default directory holding backing files and snapshots.
pub const DEFAULT_BACKING_DIR: &str = "/var/lib/rawfile-csi";
/// Mount table consulted when looking for loop devices bound to a target.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";
/// Filesystem used when a publish request does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";
/// Capacity assigned when `CreateVolume` does not ask for a size.
pub const DEFAULT_VOLUME_SIZE: u64 = 1024 * 1024 * 1024;
/// Topology key carrying the node hostname.
pub const TOPOLOGY_HOSTNAME_KEY: &str = "kubernetes.io/hostname";

/// Polling bounds for node-pinned snapshot jobs.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotTimeouts {
    /// Delay between two phase checks.
    pub poll_interval: Duration,
    /// Upper bound for a snapshot copy.
    pub copy: Duration,
    /// Upper bound for existence checks and deletes.
    pub check: Duration,
}

impl Default for SnapshotTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            copy: Duration::from_secs(120),
            check: Duration::from_secs(30),
        }
    }
}

/// Explicit configuration threaded through every raw-file component.
#[derive(Debug, Clone)]
pub struct RawfileConfig {
    pub driver_name: String,
    pub vendor_version: String,
    pub node_id: String,
    pub backing_dir: PathBuf,
    pub mount_table: PathBuf,
    pub snapshot_timeouts: SnapshotTimeouts,
    pub gc_interval: Duration,
}

impl RawfileConfig {
    /// Configuration with defaults for everything but the node and directory.
    pub fn new(node_id: impl Into<String>, backing_dir: impl AsRef<Path>) -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: node_id.into(),
            backing_dir: backing_dir.as_ref().to_path_buf(),
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
            snapshot_timeouts: SnapshotTimeouts::default(),
            gc_interval: Duration::from_secs(300),
        }
    }

    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = name.into();
        self
    }

    pub fn with_mount_table(mut self, path: impl AsRef<Path>) -> Self {
        self.mount_table = path.as_ref().to_path_buf();
        self
    }

    pub fn with_snapshot_timeouts(mut self, timeouts: SnapshotTimeouts) -> Self {
        self.snapshot_timeouts = timeouts;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RawfileConfig::new("node-a", "/data");
        assert_eq!(cfg.driver_name, DEFAULT_DRIVER_NAME);
        assert_eq!(cfg.mount_table, PathBuf::from("/proc/self/mounts"));
        assert_eq!(cfg.gc_interval, Duration::from_secs(300));
        assert_eq!(cfg.snapshot_timeouts.copy, Duration::from_secs(120));
        assert_eq!(cfg.snapshot_timeouts.check, Duration::from_secs(30));
    }
}
