//! Loop device management.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::exec::CommandExecutor;
use crate::error::CsiError;

const LOSETUP: &str = "losetup";

/// Attaches backing files to loop devices and finds existing bindings.
pub struct LoopDeviceManager {
    exec: Arc<dyn CommandExecutor>,
    mount_table: PathBuf,
}

impl LoopDeviceManager {
    pub fn new(exec: Arc<dyn CommandExecutor>, mount_table: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            mount_table: mount_table.into(),
        }
    }

    /// Bind `file` to a free loop device and return the device path.
    #[instrument(skip(self, file), fields(file = %file.display()))]
    pub async fn attach(&self, file: &Path) -> Result<String, CsiError> {
        let file = path_str(file)?;
        let args = ["-f", "--show", file];
        let out = self.exec.run(LOSETUP, &args).await?;
        let stdout = out.into_result(LOSETUP, &args)?;
        let device = stdout
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("/dev/"))
            .ok_or_else(|| CsiError::CommandFailed {
                command: format!("{LOSETUP} -f --show {file}"),
                output: format!("no device path in output: {}", stdout.trim()),
            })?
            .to_owned();
        info!(%device, "loop device attached");
        Ok(device)
    }

    /// Loop device already bound to `file`, if any (`losetup -j`).
    pub async fn find_attached(&self, file: &Path) -> Result<Option<String>, CsiError> {
        let file = path_str(file)?;
        let args = ["-j", file];
        let out = self.exec.run(LOSETUP, &args).await?;
        let stdout = out.into_result(LOSETUP, &args)?;
        // `/dev/loop3: [2049]:131 (/var/lib/rawfile-csi/vol-1.img)`
        Ok(stdout
            .lines()
            .filter_map(|l| l.split_once(':'))
            .map(|(dev, _)| dev.trim())
            .find(|dev| dev.starts_with("/dev/loop"))
            .map(str::to_owned))
    }

    /// Attach `file`, reusing an existing binding instead of creating a
    /// second one.
    pub async fn attach_or_reuse(&self, file: &Path) -> Result<String, CsiError> {
        if let Some(device) = self.find_attached(file).await? {
            debug!(%device, file = %file.display(), "reusing existing loop binding");
            return Ok(device);
        }
        self.attach(file).await
    }

    /// Loop device mounted at `target`, from the mount table.
    ///
    /// Absence is not an error: callers treat it as "nothing to unmount".
    pub async fn find_bound_device(&self, target: &str) -> Result<Option<String>, CsiError> {
        let table = match tokio::fs::read_to_string(&self.mount_table).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "read {}: {e}",
                    self.mount_table.display()
                )));
            }
        };
        Ok(bound_device_in(&table, target))
    }

    /// Release a loop device.
    #[instrument(skip(self))]
    pub async fn detach(&self, device: &str) -> Result<(), CsiError> {
        let args = ["-d", device];
        self.exec.run(LOSETUP, &args).await?.into_result(LOSETUP, &args)?;
        info!(%device, "loop device detached");
        Ok(())
    }
}

/// First-token device of the first mount line naming both `target` and a
/// loop device.
fn bound_device_in(table: &str, target: &str) -> Option<String> {
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let has_target = fields.iter().any(|f| *f == target);
        let has_loop = fields.iter().any(|f| f.starts_with("/dev/loop"));
        (has_target && has_loop).then(|| fields[0].to_owned())
    })
}

pub(crate) fn path_str(path: &Path) -> Result<&str, CsiError> {
    path.to_str()
        .ok_or_else(|| CsiError::InvalidArgument(format!("non-UTF8 path {}", path.display())))
}
