//! Backing-file layout and just-in-time materialization.
//!
//! ```text
//! <backing_dir>/
//!   <volume-id>.img      # sparse backing file of a volume
//!   <snapshot-id>.snap   # full copy of a volume at snapshot time
//! ```

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use crate::error::CsiError;

pub const IMAGE_SUFFIX: &str = "img";
pub const SNAPSHOT_SUFFIX: &str = "snap";

/// Outcome of [`VolumeStore::materialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// A new sparse file of the requested size was created.
    Created,
    /// A new file was filled from a snapshot.
    Restored,
    /// The file was already present and left untouched.
    Existing,
}

/// Owns the mapping from volume and snapshot ids to files on disk.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    dir: PathBuf,
}

impl VolumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<volume_id>.img`
    pub fn backing_file_path(&self, volume_id: &str) -> PathBuf {
        self.dir.join(format!("{volume_id}.{IMAGE_SUFFIX}"))
    }

    /// `<dir>/<snapshot_id>.snap`
    pub fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{snapshot_id}.{SNAPSHOT_SUFFIX}"))
    }

    /// Make sure `path` exists.
    ///
    /// An existing file is never modified. Otherwise the file is filled from
    /// `snapshot` when given, or truncated to `size` bytes (sparse).
    #[instrument(skip(self, path, snapshot), fields(path = %path.display()))]
    pub async fn materialize(
        &self,
        path: &Path,
        size: Option<u64>,
        snapshot: Option<&Path>,
    ) -> Result<Materialized, CsiError> {
        if tokio::fs::try_exists(path).await? {
            return Ok(Materialized::Existing);
        }

        if let Some(snap) = snapshot
            && !tokio::fs::try_exists(snap).await?
        {
            return Err(CsiError::SnapshotNotFound(snap.display().to_string()));
        }
        if snapshot.is_none() && size.is_none() {
            return Err(CsiError::InvalidArgument(format!(
                "{} does not exist and no size was given",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(f) => f,
            // Raced with another creator.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(Materialized::Existing);
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match snapshot {
            Some(snap) => {
                let res = async {
                    let mut src = tokio::fs::File::open(snap).await?;
                    let copied = tokio::io::copy(&mut src, &mut file).await?;
                    file.flush().await?;
                    Ok::<_, std::io::Error>(copied)
                }
                .await;
                match res {
                    Ok(copied) => {
                        info!(snapshot = %snap.display(), bytes = copied, "restored from snapshot");
                        Materialized::Restored
                    }
                    Err(e) => {
                        // Leave no half-written file behind for the next publish.
                        let _ = tokio::fs::remove_file(path).await;
                        return Err(CsiError::BackendError(format!(
                            "restore {} from {}: {e}",
                            path.display(),
                            snap.display()
                        )));
                    }
                }
            }
            None => {
                let size = size.unwrap_or_default();
                if let Err(e) = file.set_len(size).await {
                    let _ = tokio::fs::remove_file(path).await;
                    return Err(e.into());
                }
                info!(size, "backing file created");
                Materialized::Created
            }
        };

        let len = file.metadata().await?.len();
        if len == 0 {
            warn!("backing file is empty, loop attach will fail");
        }
        Ok(outcome)
    }

    /// All `*.img` files directly under the backing directory.
    pub async fn list_backing_files(&self) -> Result<Vec<PathBuf>, CsiError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CsiError::BackendError(format!(
                    "read_dir {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(IMAGE_SUFFIX) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_conventions() {
        let store = VolumeStore::new("/data");
        assert_eq!(
            store.backing_file_path("vol-1"),
            PathBuf::from("/data/vol-1.img")
        );
        assert_eq!(
            store.snapshot_path("snap-1"),
            PathBuf::from("/data/snap-1.snap")
        );
    }

    #[tokio::test]
    async fn created_file_has_exact_size() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path());
        let path = store.backing_file_path("vol-a");

        let out = store
            .materialize(&path, Some(1_048_576), None)
            .await
            .unwrap();
        assert_eq!(out, Materialized::Created);
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 1_048_576);
    }

    #[tokio::test]
    async fn existing_file_is_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path());
        let path = store.backing_file_path("vol-a");
        tokio::fs::write(&path, b"data").await.unwrap();

        let out = store.materialize(&path, Some(4096), None).await.unwrap();
        assert_eq!(out, Materialized::Existing);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn creates_missing_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path().join("nested/dir"));
        let path = store.backing_file_path("vol-a");

        store.materialize(&path, Some(512), None).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn restore_copies_snapshot_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path());
        let snap = store.snapshot_path("snap-1");
        tokio::fs::write(&snap, b"hello snapshot").await.unwrap();
        let path = store.backing_file_path("vol-b");

        let out = store
            .materialize(&path, Some(1 << 20), Some(&snap))
            .await
            .unwrap();
        assert_eq!(out, Materialized::Restored);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello snapshot");
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path());
        let path = store.backing_file_path("vol-c");

        let err = store
            .materialize(&path, Some(1024), Some(&store.snapshot_path("gone")))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::SnapshotNotFound(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_size_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path());
        let err = store
            .materialize(&store.backing_file_path("vol-d"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn lists_only_images() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(tmp.path());
        for name in ["vol-1.img", "vol-2.img", "snap-1.snap", "notes.txt"] {
            tokio::fs::write(tmp.path().join(name), b"x").await.unwrap();
        }
        tokio::fs::create_dir(tmp.path().join("dir.img")).await.unwrap();

        let files = store.list_backing_files().await.unwrap();
        assert_eq!(
            files,
            vec![tmp.path().join("vol-1.img"), tmp.path().join("vol-2.img")]
        );
    }

    #[tokio::test]
    async fn missing_dir_lists_nothing() {
        let store = VolumeStore::new("/nonexistent/rawfile-test-dir");
        assert!(store.list_backing_files().await.unwrap().is_empty());
    }
}
