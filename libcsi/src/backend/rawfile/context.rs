//! Volume context passed from `CreateVolume` to `NodePublishVolume`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::CsiError;

pub const KEY_BACKING_FILE: &str = "backingFile";
pub const KEY_SIZE: &str = "size";
pub const KEY_RESTORE_FROM_SNAPSHOT: &str = "restoreFromSnapshot";
pub const KEY_SNAPSHOT_FILE: &str = "snapshotFile";

/// Typed view of the flat string map carried in the CSI volume context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawfileContext {
    pub backing_file: PathBuf,
    pub size: Option<u64>,
    pub restore_from_snapshot: Option<String>,
    pub snapshot_file: Option<PathBuf>,
}

impl RawfileContext {
    pub fn parse(ctx: &HashMap<String, String>) -> Result<Self, CsiError> {
        let backing_file = ctx
            .get(KEY_BACKING_FILE)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                CsiError::InvalidArgument(format!("volume context is missing {KEY_BACKING_FILE}"))
            })?;

        let size = match ctx.get(KEY_SIZE).filter(|v| !v.is_empty()) {
            Some(raw) => Some(raw.parse::<u64>().map_err(|e| {
                CsiError::InvalidArgument(format!("invalid {KEY_SIZE} {raw:?}: {e}"))
            })?),
            None => None,
        };

        Ok(Self {
            backing_file,
            size,
            restore_from_snapshot: non_empty(ctx, KEY_RESTORE_FROM_SNAPSHOT),
            snapshot_file: non_empty(ctx, KEY_SNAPSHOT_FILE).map(PathBuf::from),
        })
    }

    pub fn into_map(self) -> HashMap<String, String> {
        let mut map = HashMap::from([(
            KEY_BACKING_FILE.to_owned(),
            self.backing_file.to_string_lossy().into_owned(),
        )]);
        if let Some(size) = self.size {
            map.insert(KEY_SIZE.to_owned(), size.to_string());
        }
        if let Some(id) = self.restore_from_snapshot {
            map.insert(KEY_RESTORE_FROM_SNAPSHOT.to_owned(), id);
        }
        if let Some(file) = self.snapshot_file {
            map.insert(
                KEY_SNAPSHOT_FILE.to_owned(),
                file.to_string_lossy().into_owned(),
            );
        }
        map
    }
}

fn non_empty(ctx: &HashMap<String, String>, key: &str) -> Option<String> {
    ctx.get(key).filter(|v| !v.is_empty()).cloned()
}
