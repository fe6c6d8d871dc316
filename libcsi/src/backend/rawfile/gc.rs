//! Node-local garbage collection of orphaned backing files.
//!
//! Each cycle compares the `*.img` files under the backing directory with the
//! volumes the registry declares for this driver and deletes the rest. Without
//! a registry nothing is ever deleted.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cluster::VolumeRegistry;
use super::config::RawfileConfig;
use super::store::VolumeStore;
use crate::error::CsiError;

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub scanned: usize,
    pub deleted: Vec<PathBuf>,
    pub failed: usize,
    /// Set when the cycle was skipped because no registry is configured.
    pub skipped: bool,
}

pub struct GarbageCollector {
    config: Arc<RawfileConfig>,
    store: VolumeStore,
    registry: Option<Arc<dyn VolumeRegistry>>,
}

impl GarbageCollector {
    pub fn new(config: Arc<RawfileConfig>, registry: Option<Arc<dyn VolumeRegistry>>) -> Self {
        Self {
            store: VolumeStore::new(&config.backing_dir),
            config,
            registry,
        }
    }

    /// Run one reconciliation cycle.
    ///
    /// A registry failure aborts the cycle before anything is deleted.
    pub async fn collect_once(&self) -> Result<GcReport, CsiError> {
        let Some(registry) = &self.registry else {
            debug!("no volume registry, skipping garbage collection");
            return Ok(GcReport {
                skipped: true,
                ..Default::default()
            });
        };

        // Enumerate before reading the registry so files created after this
        // point are never candidates.
        let files = self.store.list_backing_files().await?;
        let entries = registry.list().await?;

        let mut active: HashSet<PathBuf> = HashSet::new();
        for entry in entries
            .iter()
            .filter(|e| e.driver_name == self.config.driver_name)
        {
            if let Some(file) = entry.backing_file() {
                active.insert(PathBuf::from(file));
            }
            active.insert(self.store.backing_file_path(&entry.volume_handle));
        }

        let mut report = GcReport {
            scanned: files.len(),
            ..Default::default()
        };
        for file in files.into_iter().filter(|f| !active.contains(f)) {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {
                    info!(file = %file.display(), "deleted orphaned backing file");
                    report.deleted.push(file);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "failed to delete orphaned backing file");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Collect every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!(?interval, dir = %self.store.dir().display(), "garbage collector started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.collect_once().await {
                    Ok(report) if !report.deleted.is_empty() || report.failed > 0 => {
                        info!(
                            scanned = report.scanned,
                            deleted = report.deleted.len(),
                            failed = report.failed,
                            "garbage collection cycle finished",
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "garbage collection cycle aborted"),
                },
            }
        }
        info!("garbage collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use async_trait::async_trait;

    use super::super::cluster::{ClusterError, RegistryEntry, StaticRegistry};
    use super::super::context::KEY_BACKING_FILE;
    use super::*;

    const DRIVER: &str = "rk8s.rawfile.csi";

    struct DownRegistry;

    #[async_trait]
    impl VolumeRegistry for DownRegistry {
        async fn get(&self, id: &str) -> Result<RegistryEntry, ClusterError> {
            Err(ClusterError::Unavailable(id.to_owned()))
        }

        async fn list(&self) -> Result<Vec<RegistryEntry>, ClusterError> {
            Err(ClusterError::Unavailable("connection refused".into()))
        }
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
    }

    fn registered(handle: &str) -> RegistryEntry {
        RegistryEntry {
            driver_name: DRIVER.into(),
            volume_handle: handle.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn removes_only_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), &["vol-active.img", "vol-orphaned.img", "snap-1.snap"]);
        let registry = Arc::new(StaticRegistry::new());
        registry.insert(registered("vol-active"));

        let gc = GarbageCollector::new(
            Arc::new(RawfileConfig::new("n", tmp.path())),
            Some(registry),
        );
        let report = gc.collect_once().await.unwrap();

        assert!(tmp.path().join("vol-active.img").exists());
        assert!(!tmp.path().join("vol-orphaned.img").exists());
        assert!(tmp.path().join("snap-1.snap").exists());
        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, vec![tmp.path().join("vol-orphaned.img")]);
    }

    #[tokio::test]
    async fn honours_recorded_backing_file_and_driver() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), &["legacy-name.img", "vol-foreign.img"]);
        let registry = Arc::new(StaticRegistry::new());
        let mut legacy = registered("vol-legacy");
        legacy.attributes = HashMap::from([(
            KEY_BACKING_FILE.to_owned(),
            tmp.path().join("legacy-name.img").to_string_lossy().into_owned(),
        )]);
        registry.insert(legacy);
        let mut foreign = registered("vol-foreign");
        foreign.driver_name = "other.csi".into();
        registry.insert(foreign);

        let gc = GarbageCollector::new(
            Arc::new(RawfileConfig::new("n", tmp.path())),
            Some(registry),
        );
        gc.collect_once().await.unwrap();

        assert!(tmp.path().join("legacy-name.img").exists());
        assert!(!tmp.path().join("vol-foreign.img").exists());
    }

    #[tokio::test]
    async fn no_registry_deletes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), &["vol-1.img", "vol-2.img"]);

        let gc = GarbageCollector::new(Arc::new(RawfileConfig::new("n", tmp.path())), None);
        let report = gc.collect_once().await.unwrap();

        assert!(report.skipped);
        assert!(report.deleted.is_empty());
        assert!(tmp.path().join("vol-1.img").exists());
        assert!(tmp.path().join("vol-2.img").exists());
    }

    #[tokio::test]
    async fn registry_failure_aborts_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), &["vol-1.img"]);

        let gc = GarbageCollector::new(
            Arc::new(RawfileConfig::new("n", tmp.path())),
            Some(Arc::new(DownRegistry)),
        );
        assert!(gc.collect_once().await.is_err());
        assert!(tmp.path().join("vol-1.img").exists());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), &["vol-orphan.img"]);
        let gc = GarbageCollector::new(
            Arc::new(RawfileConfig::new("n", tmp.path())),
            Some(Arc::new(StaticRegistry::new())),
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(gc.run(Duration::from_millis(10), token.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(!tmp.path().join("vol-orphan.img").exists());
    }
}
