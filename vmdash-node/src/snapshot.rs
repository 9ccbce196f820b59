use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{NodeError, Result};
use crate::image_tool::ImageTool;
use crate::model::Snapshot;
use crate::state::StateStore;

/// Creates qcow2 overlays on top of VM disks. Snapshots are not tracked
/// after creation.
pub struct SnapshotEngine {
    snapshot_dir: PathBuf,
    store: Arc<StateStore>,
    tool: Arc<dyn ImageTool>,
}

impl SnapshotEngine {
    pub fn new(
        snapshot_dir: impl Into<PathBuf>,
        store: Arc<StateStore>,
        tool: Arc<dyn ImageTool>,
    ) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            store,
            tool,
        }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, vm_id: Uuid) -> Result<Snapshot> {
        let record = self.store.get(vm_id).await?;
        if !tokio::fs::try_exists(&record.disk_path).await? {
            return Err(NodeError::not_found(format!(
                "disk {}",
                record.disk_path.display()
            )));
        }
        // The overlay stores its backing path verbatim.
        let backing = tokio::fs::canonicalize(&record.disk_path).await?;
        let stem = backing
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| record.disk_name.clone());

        let created_at = Utc::now();
        let stamp = created_at.format("%Y%m%d%H%M%S");
        let mut filename = format!("{stem}-{stamp}.qcow2");
        let mut n = 1;
        while tokio::fs::try_exists(self.snapshot_dir.join(&filename)).await? {
            filename = format!("{stem}-{stamp}-{n}.qcow2");
            n += 1;
        }
        let path = self.snapshot_dir.join(&filename);

        self.tool
            .create_overlay(&path, &backing, record.disk_format)
            .await?;
        info!(vm = %record.name, snapshot = %filename, "Snapshot created");

        Ok(Snapshot {
            vm_id,
            filename,
            path,
            backing_file: backing,
            created_at,
        })
    }
}
