use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::config::RawfileConfig;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::types::{PluginCapability, PluginInfo};

/// [`CsiIdentity`] for the raw-file plugin.
pub struct RawfileIdentity {
    config: Arc<RawfileConfig>,
    controller_enabled: bool,
}

impl RawfileIdentity {
    pub fn new(config: Arc<RawfileConfig>, controller_enabled: bool) -> Self {
        Self {
            config,
            controller_enabled,
        }
    }
}

#[async_trait]
impl CsiIdentity for RawfileIdentity {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Ready once the backing directory is usable.
        match tokio::fs::create_dir_all(&self.config.backing_dir).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(dir = %self.config.backing_dir.display(), error = %e, "backing directory unavailable");
                Ok(false)
            }
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let mut caps = Vec::with_capacity(2);
        if self.controller_enabled {
            caps.push(PluginCapability::ControllerService);
        }
        caps.push(PluginCapability::VolumeAccessibilityConstraints);
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plugin_info_and_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(
            RawfileConfig::new("n", tmp.path().join("backing")).with_driver_name("test.csi"),
        );
        let identity = RawfileIdentity::new(config, true);

        assert_eq!(identity.get_plugin_info().await.unwrap().name, "test.csi");
        assert!(identity.probe().await.unwrap());
        assert!(tmp.path().join("backing").is_dir());
    }

    #[tokio::test]
    async fn probe_unusable_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"").unwrap();
        let identity = RawfileIdentity::new(Arc::new(RawfileConfig::new("n", &file)), false);
        assert!(!identity.probe().await.unwrap());
    }

    #[tokio::test]
    async fn capabilities_follow_mode() {
        let config = Arc::new(RawfileConfig::new("n", "/tmp"));
        let node_only = RawfileIdentity::new(Arc::clone(&config), false);
        assert_eq!(
            node_only.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::VolumeAccessibilityConstraints]
        );
        let both = RawfileIdentity::new(config, true);
        assert!(
            both.get_plugin_capabilities()
                .await
                .unwrap()
                .contains(&PluginCapability::ControllerService)
        );
    }
}
