//! Node half of the raw-file plugin.
//!
//! Publish runs a fixed sequence, each step idempotent on its own so that a
//! retried call converges instead of failing:
//!
//! 1. create the target directory
//! 2. materialize the backing file (create sparse, restore, or reuse)
//! 3. attach it to a loop device (reusing an existing binding)
//! 4. format the device unless it already carries a filesystem
//! 5. mount the device at the target
//!
//! Nothing is rolled back on failure.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::config::{DEFAULT_FS_TYPE, RawfileConfig, TOPOLOGY_HOSTNAME_KEY};
use super::context::{KEY_BACKING_FILE, RawfileContext};
use super::exec::CommandExecutor;
use super::loopdev::LoopDeviceManager;
use super::store::VolumeStore;
use super::usage;
use crate::error::CsiError;
use crate::node::CsiNode;
use crate::types::*;

/// `blkid` exit code when no filesystem signature was found.
const BLKID_NOTHING_FOUND: i32 = 2;

/// [`CsiNode`] for raw-file volumes.
pub struct RawfileNode {
    config: Arc<RawfileConfig>,
    store: VolumeStore,
    loopdev: LoopDeviceManager,
    exec: Arc<dyn CommandExecutor>,
}

impl RawfileNode {
    pub fn new(config: Arc<RawfileConfig>, exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            store: VolumeStore::new(&config.backing_dir),
            loopdev: LoopDeviceManager::new(Arc::clone(&exec), &config.mount_table),
            config,
            exec,
        }
    }

    /// Filesystem type currently on `device`, if any.
    async fn probe_fs(&self, device: &str) -> Result<Option<String>, CsiError> {
        let args = ["-o", "value", "-s", "TYPE", device];
        let out = self.exec.run("blkid", &args).await?;
        if !out.success && out.code == Some(BLKID_NOTHING_FOUND) {
            return Ok(None);
        }
        let fs = out.into_result("blkid", &args)?.trim().to_owned();
        Ok((!fs.is_empty()).then_some(fs))
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<(), CsiError> {
        let program = format!("mkfs.{fs_type}");
        let args = [device];
        self.exec.run(&program, &args).await?.into_result(&program, &args)?;
        info!(%device, fs_type, "device formatted");
        Ok(())
    }

    async fn mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([device, target]);

        let out = self.exec.run("mount", &args).await?;
        out.into_result("mount", &args)
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// `mkfs.<fs>` is built from the request, so only plain names are accepted.
fn validate_fs_type(fs_type: &str) -> Result<(), CsiError> {
    let ok = !fs_type.is_empty()
        && fs_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CsiError::InvalidArgument(format!(
            "unsupported filesystem type {fs_type:?}"
        )))
    }
}

#[async_trait]
impl CsiNode for RawfileNode {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        debug!(volume_id = %req.volume_id, "stage is a no-op");
        Ok(())
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), CsiError> {
        debug!(%volume_id, "unstage is a no-op");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path is required".into()));
        }
        let capability = req.volume_capability.clone().unwrap_or_default();
        if matches!(capability.access_type, AccessType::Block) {
            return Err(CsiError::InvalidArgument(
                "block volumes are not supported".into(),
            ));
        }
        let fs_type = capability.fs_type().unwrap_or(DEFAULT_FS_TYPE);
        validate_fs_type(fs_type)?;

        let mut raw_ctx = req.volume_context.clone();
        raw_ctx
            .entry(KEY_BACKING_FILE.to_owned())
            .or_insert_with(|| {
                self.store
                    .backing_file_path(&req.volume_id.0)
                    .to_string_lossy()
                    .into_owned()
            });
        let ctx = RawfileContext::parse(&raw_ctx)?;

        if let Some(device) = self.loopdev.find_bound_device(&req.target_path).await? {
            let backing = if tokio::fs::try_exists(&ctx.backing_file).await? {
                self.loopdev.find_attached(&ctx.backing_file).await?
            } else {
                None
            };
            if backing.as_deref() == Some(device.as_str()) {
                debug!(%device, "target already mounted");
                return Ok(());
            }
            return Err(CsiError::FailedPrecondition(format!(
                "{} already has {device} mounted, which does not back {}",
                req.target_path,
                ctx.backing_file.display()
            )));
        }

        tokio::fs::create_dir_all(&req.target_path)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: e.to_string(),
            })?;

        let snapshot = ctx.restore_from_snapshot.as_ref().map(|id| {
            ctx.snapshot_file
                .clone()
                .unwrap_or_else(|| self.store.snapshot_path(id))
        });
        let outcome = self
            .store
            .materialize(&ctx.backing_file, ctx.size, snapshot.as_deref())
            .await?;
        debug!(?outcome, backing_file = %ctx.backing_file.display(), "backing file ready");

        let device = self.loopdev.attach_or_reuse(&ctx.backing_file).await?;

        match self.probe_fs(&device).await? {
            Some(existing) => debug!(%device, fs = %existing, "device already formatted"),
            None => self.format(&device, fs_type).await?,
        }

        let mut options = capability.mount_flags().to_vec();
        if req.read_only {
            options.push("ro".to_owned());
        }
        self.mount(&device, &req.target_path, fs_type, &options).await?;

        info!(%device, fs_type, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path is required".into()));
        }
        if !tokio::fs::try_exists(target_path).await? {
            debug!("target path gone, nothing to unpublish");
            return Ok(());
        }

        match self.loopdev.find_bound_device(target_path).await? {
            None => debug!("no loop device mounted at target"),
            Some(device) => {
                let args = [target_path];
                self.exec
                    .run("umount", &args)
                    .await?
                    .into_result("umount", &args)
                    .map_err(|e| CsiError::UnmountFailed {
                        path: target_path.to_owned(),
                        reason: e.to_string(),
                    })?;
                info!(%device, "target unmounted");
                self.loopdev.detach(&device).await?;
            }
        }

        if let Err(e) = tokio::fs::remove_dir(target_path).await {
            warn!(error = %e, "failed to remove target directory");
        }
        info!("volume unpublished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        if volume_path.is_empty() {
            return Err(CsiError::InvalidArgument("volume path is required".into()));
        }
        if !tokio::fs::try_exists(volume_path).await? {
            return Err(CsiError::VolumeNotFound(format!(
                "{volume_id} at {volume_path}"
            )));
        }
        usage::filesystem_stats(Path::new(volume_path))
    }

    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        _volume_path: &str,
        bytes: u64,
    ) -> Result<u64, CsiError> {
        debug!(%volume_id, bytes, "expand is a no-op");
        Ok(bytes)
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::GetVolumeStats])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: 0,
            accessible_topology: Some(Topology::single(
                TOPOLOGY_HOSTNAME_KEY,
                self.config.node_id.clone(),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::super::context::{KEY_RESTORE_FROM_SNAPSHOT, KEY_SIZE, KEY_SNAPSHOT_FILE};
    use super::super::exec::CommandOutput;
    use super::super::exec::testing::ScriptedExecutor;
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        dir: PathBuf,
        mounts: PathBuf,
        exec: Arc<ScriptedExecutor>,
        node: RawfileNode,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("backing");
        let mounts = tmp.path().join("mounts");
        std::fs::write(&mounts, "").unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let config = Arc::new(RawfileConfig::new("node-a", &dir).with_mount_table(&mounts));
        let node = RawfileNode::new(config, exec.clone());
        Fixture {
            dir,
            mounts,
            exec,
            node,
            _tmp: tmp,
        }
    }

    impl Fixture {
        fn target(&self) -> String {
            self.dir
                .parent()
                .unwrap()
                .join("pods/p1/mount")
                .to_string_lossy()
                .into_owned()
        }

        fn backing(&self, id: &str) -> PathBuf {
            self.dir.join(format!("{id}.img"))
        }

        fn request(&self, id: &str, size: u64) -> NodePublishVolumeRequest {
            NodePublishVolumeRequest {
                volume_id: VolumeId::from(id),
                target_path: self.target(),
                staging_target_path: None,
                volume_capability: Some(VolumeCapability::mount("")),
                read_only: false,
                volume_context: HashMap::from([
                    (
                        KEY_BACKING_FILE.to_owned(),
                        self.backing(id).to_string_lossy().into_owned(),
                    ),
                    (KEY_SIZE.to_owned(), size.to_string()),
                ]),
            }
        }

        fn mount_target(&self, device: &str) {
            std::fs::write(
                &self.mounts,
                format!("{device} {} ext4 rw,relatime 0 0\n", self.target()),
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn first_publish_creates_attaches_formats_and_mounts() {
        let f = fixture();
        f.exec.push("losetup", CommandOutput::ok(""));
        f.exec.push("losetup", CommandOutput::ok("/dev/loop5\n"));
        f.exec.push("blkid", CommandOutput::failed(2, ""));

        f.node.publish_volume(f.request("vol-1", 1 << 20)).await.unwrap();

        let backing = f.backing("vol-1");
        assert_eq!(std::fs::metadata(&backing).unwrap().len(), 1 << 20);
        assert!(Path::new(&f.target()).is_dir());
        let b = backing.to_string_lossy();
        assert_eq!(
            f.exec.calls(),
            vec![
                format!("losetup -j {b}"),
                format!("losetup -f --show {b}"),
                "blkid -o value -s TYPE /dev/loop5".to_owned(),
                "mkfs.ext4 /dev/loop5".to_owned(),
                format!("mount -t ext4 /dev/loop5 {}", f.target()),
            ]
        );
    }

    #[tokio::test]
    async fn republish_does_not_reformat() {
        let f = fixture();
        std::fs::create_dir_all(&f.dir).unwrap();
        std::fs::write(f.backing("vol-1"), b"existing").unwrap();
        f.exec.push("losetup", CommandOutput::ok("/dev/loop5: [2049]:12 (x)\n"));
        f.exec.push("blkid", CommandOutput::ok("ext4\n"));

        f.node.publish_volume(f.request("vol-1", 1 << 20)).await.unwrap();

        assert!(f.exec.calls_to("mkfs.ext4").is_empty());
        assert_eq!(f.exec.calls_to("losetup").len(), 1, "existing binding reused");
        assert_eq!(std::fs::read(f.backing("vol-1")).unwrap(), b"existing");
        assert_eq!(f.exec.calls_to("mount").len(), 1);
    }

    #[tokio::test]
    async fn publish_short_circuits_when_target_is_bound() {
        let f = fixture();
        std::fs::create_dir_all(&f.dir).unwrap();
        std::fs::write(f.backing("vol-1"), b"existing").unwrap();
        f.mount_target("/dev/loop5");
        f.exec.push("losetup", CommandOutput::ok("/dev/loop5: [2049]:12 (x)\n"));

        f.node.publish_volume(f.request("vol-1", 1 << 20)).await.unwrap();
        assert_eq!(
            f.exec.calls(),
            vec![format!("losetup -j {}", f.backing("vol-1").display())]
        );
    }

    #[tokio::test]
    async fn publish_rejects_target_bound_to_another_volume() {
        let f = fixture();
        std::fs::create_dir_all(&f.dir).unwrap();
        std::fs::write(f.backing("vol-1"), b"existing").unwrap();
        f.mount_target("/dev/loop7");
        f.exec.push("losetup", CommandOutput::ok("/dev/loop5: [2049]:12 (x)\n"));

        let err = f
            .node
            .publish_volume(f.request("vol-1", 1 << 20))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)), "{err:?}");
        assert!(f.exec.calls_to("mount").is_empty());

        let f = fixture();
        f.mount_target("/dev/loop7");
        let err = f
            .node
            .publish_volume(f.request("vol-2", 1 << 20))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)), "{err:?}");
        assert!(f.exec.calls().is_empty());
        assert!(!f.backing("vol-2").exists());
    }

    #[tokio::test]
    async fn publish_passes_mount_options() {
        let f = fixture();
        f.exec.push("losetup", CommandOutput::ok(""));
        f.exec.push("losetup", CommandOutput::ok("/dev/loop2\n"));
        f.exec.push("blkid", CommandOutput::ok("xfs\n"));

        let mut req = f.request("vol-2", 1 << 20);
        req.read_only = true;
        req.volume_capability = Some(VolumeCapability {
            access_type: AccessType::Mount {
                fs_type: "xfs".into(),
                mount_flags: vec!["noatime".into()],
            },
            access_mode: AccessMode::SingleNodeReaderOnly,
        });
        f.node.publish_volume(req).await.unwrap();

        assert_eq!(
            f.exec.calls_to("mount"),
            vec![format!("mount -t xfs -o noatime,ro /dev/loop2 {}", f.target())]
        );
    }

    #[tokio::test]
    async fn attach_failure_surfaces_tool_output() {
        let f = fixture();
        f.exec.push("losetup", CommandOutput::ok(""));
        f.exec.push(
            "losetup",
            CommandOutput::failed(1, "losetup: /dev/loop-control: Permission denied"),
        );

        let err = f
            .node
            .publish_volume(f.request("vol-1", 4096))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
        assert!(f.exec.calls_to("mount").is_empty());
    }

    #[tokio::test]
    async fn mount_failure_is_mount_failed() {
        let f = fixture();
        f.exec.push("losetup", CommandOutput::ok(""));
        f.exec.push("losetup", CommandOutput::ok("/dev/loop1\n"));
        f.exec.push("blkid", CommandOutput::ok("ext4\n"));
        f.exec.push("mount", CommandOutput::failed(32, "mount: wrong fs type"));

        let err = f
            .node
            .publish_volume(f.request("vol-1", 4096))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }));
        assert!(err.to_string().contains("wrong fs type"));
    }

    #[tokio::test]
    async fn publish_rejects_bad_requests() {
        let f = fixture();

        let mut req = f.request("vol-1", 4096);
        req.volume_capability = Some(VolumeCapability {
            access_type: AccessType::Block,
            access_mode: AccessMode::SingleNodeWriter,
        });
        assert!(matches!(
            f.node.publish_volume(req).await,
            Err(CsiError::InvalidArgument(_))
        ));

        let mut req = f.request("vol-1", 4096);
        req.volume_capability = Some(VolumeCapability::mount("ext4; rm -rf /"));
        assert!(matches!(
            f.node.publish_volume(req).await,
            Err(CsiError::InvalidArgument(_))
        ));

        let mut req = f.request("vol-1", 4096);
        req.target_path.clear();
        assert!(f.node.publish_volume(req).await.is_err());
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn restore_copies_snapshot_content() {
        let f = fixture();
        std::fs::create_dir_all(&f.dir).unwrap();
        let snap = f.dir.join("snap-1.snap");
        std::fs::write(&snap, b"snapshot payload").unwrap();
        f.exec.push("losetup", CommandOutput::ok(""));
        f.exec.push("losetup", CommandOutput::ok("/dev/loop3\n"));
        f.exec.push("blkid", CommandOutput::ok("ext4\n"));

        let mut req = f.request("vol-r", 1 << 20);
        req.volume_context
            .insert(KEY_RESTORE_FROM_SNAPSHOT.to_owned(), "snap-1".to_owned());
        req.volume_context.insert(
            KEY_SNAPSHOT_FILE.to_owned(),
            snap.to_string_lossy().into_owned(),
        );
        f.node.publish_volume(req).await.unwrap();

        let content = std::fs::read(f.backing("vol-r")).unwrap();
        assert!(content.starts_with(b"snapshot payload"));
        assert!(f.exec.calls_to("mkfs.ext4").is_empty());
    }

    #[tokio::test]
    async fn restore_from_missing_snapshot_fails() {
        let f = fixture();
        let mut req = f.request("vol-r", 1 << 20);
        req.volume_context
            .insert(KEY_RESTORE_FROM_SNAPSHOT.to_owned(), "snap-gone".to_owned());

        let err = f.node.publish_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::SnapshotNotFound(_)));
        assert!(!f.backing("vol-r").exists());
    }

    #[tokio::test]
    async fn unpublish_twice_succeeds() {
        let f = fixture();
        std::fs::create_dir_all(f.target()).unwrap();
        f.mount_target("/dev/loop5");
        let id = VolumeId::from("vol-1");

        f.node.unpublish_volume(&id, &f.target()).await.unwrap();
        assert_eq!(
            f.exec.calls(),
            vec![
                format!("umount {}", f.target()),
                "losetup -d /dev/loop5".to_owned(),
            ]
        );
        assert!(!Path::new(&f.target()).exists());

        f.node.unpublish_volume(&id, &f.target()).await.unwrap();
        assert_eq!(f.exec.calls().len(), 2);
    }

    #[tokio::test]
    async fn unpublish_without_loop_mount_skips_umount() {
        let f = fixture();
        std::fs::create_dir_all(f.target()).unwrap();

        f.node
            .unpublish_volume(&VolumeId::from("vol-1"), &f.target())
            .await
            .unwrap();
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn umount_failure_is_reported() {
        let f = fixture();
        std::fs::create_dir_all(f.target()).unwrap();
        f.mount_target("/dev/loop5");
        f.exec.push("umount", CommandOutput::failed(32, "umount: target is busy"));

        let err = f
            .node
            .unpublish_volume(&VolumeId::from("vol-1"), &f.target())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::UnmountFailed { .. }));
        assert!(f.exec.calls_to("losetup").is_empty());
    }

    #[tokio::test]
    async fn volume_stats() {
        let f = fixture();
        let id = VolumeId::from("vol-1");

        assert!(matches!(
            f.node.get_volume_stats(&id, "").await,
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(f
            .node
            .get_volume_stats(&id, "/nonexistent/rawfile/stats")
            .await
            .is_err());

        let tmp = tempfile::tempdir().unwrap();
        let stats = f
            .node
            .get_volume_stats(&id, tmp.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(stats.total_bytes > 0);
        assert!(stats.available_bytes <= stats.total_bytes);
    }

    #[tokio::test]
    async fn node_info_carries_hostname_topology() {
        let f = fixture();
        let info = f.node.get_info().await.unwrap();
        assert_eq!(info.node_id, "node-a");
        assert_eq!(
            info.accessible_topology,
            Some(Topology::single(TOPOLOGY_HOSTNAME_KEY, "node-a"))
        );
        assert_eq!(
            f.node.get_capabilities().await.unwrap(),
            vec![NodeCapability::GetVolumeStats]
        );
    }
}
