//! Filesystem and backing-file usage.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::warn;

use super::store::{IMAGE_SUFFIX, VolumeStore};
use crate::error::CsiError;
use crate::types::VolumeStats;

/// `st_blocks` is always counted in 512-byte units.
const STAT_BLOCK_SIZE: u64 = 512;

/// statvfs of the filesystem holding `path`.
pub fn filesystem_stats(path: &Path) -> Result<VolumeStats, CsiError> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| CsiError::Internal(format!("statvfs {}: {e}", path.display())))?;
    let frag = stat.fragment_size();
    let total = frag * stat.blocks();
    let available = frag * stat.blocks_available();
    let used = frag * stat.blocks().saturating_sub(stat.blocks_free());
    Ok(VolumeStats {
        total_bytes: total,
        available_bytes: available.min(total),
        used_bytes: used,
    })
}

/// Usage of one backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeUsage {
    pub volume_id: String,
    /// Bytes actually allocated on disk.
    pub used_bytes: u64,
    /// Apparent size of the file.
    pub total_bytes: u64,
}

/// Node-level snapshot of the backing directory.
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    pub remaining_capacity: u64,
    pub volumes: Vec<VolumeUsage>,
}

/// Collect remaining capacity and per-volume usage under the store.
///
/// Files that disappear between listing and stat are skipped.
pub async fn collect(store: &VolumeStore) -> Result<UsageReport, CsiError> {
    let remaining_capacity = if tokio::fs::try_exists(store.dir()).await? {
        filesystem_stats(store.dir())?.available_bytes
    } else {
        0
    };

    let mut volumes = Vec::new();
    for path in store.list_backing_files().await? {
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to stat backing file");
                continue;
            }
        };
        let Some(volume_id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(&format!(".{IMAGE_SUFFIX}")))
        else {
            continue;
        };
        volumes.push(VolumeUsage {
            volume_id: volume_id.to_owned(),
            used_bytes: meta.blocks() * STAT_BLOCK_SIZE,
            total_bytes: meta.len(),
        });
    }

    Ok(UsageReport {
        remaining_capacity,
        volumes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_never_exceeds_total() {
        let tmp = tempfile::tempdir().unwrap();
        let stats = filesystem_stats(tmp.path()).unwrap();
        assert!(stats.total_bytes > 0);
        assert!(stats.available_bytes <= stats.total_bytes);
    }

    #[tokio::test]
    async fn sparse_file_reports_apparent_size() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path());
        store
            .materialize(&store.backing_file_path("vol-1"), Some(8 << 20), None)
            .await
            .unwrap();

        let report = collect(&store).await.unwrap();
        assert!(report.remaining_capacity > 0);
        assert_eq!(report.volumes.len(), 1);
        let vol = &report.volumes[0];
        assert_eq!(vol.volume_id, "vol-1");
        assert_eq!(vol.total_bytes, 8 << 20);
        assert!(vol.used_bytes <= vol.total_bytes);
    }

    #[tokio::test]
    async fn missing_dir_reports_nothing() {
        let store = VolumeStore::new("/nonexistent/rawfile-usage");
        let report = collect(&store).await.unwrap();
        assert_eq!(report.remaining_capacity, 0);
        assert!(report.volumes.is_empty());
    }
}
