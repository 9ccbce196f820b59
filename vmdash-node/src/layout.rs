use std::path::{Path, PathBuf};

use tracing::info;

/// Directories the node owns. Built once from configuration and passed to
/// every component.
#[derive(Debug, Clone)]
pub struct Directories {
    pub vms: PathBuf,
    pub disks: PathBuf,
    pub isos: PathBuf,
    pub snapshots: PathBuf,
    pub logs: PathBuf,
}

impl Directories {
    /// Standard layout under a single root.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            vms: root.join("vms"),
            disks: root.join("disks"),
            isos: root.join("isos"),
            snapshots: root.join("snapshots"),
            logs: root.join("logs"),
        }
    }

    /// Create every directory. Safe to call repeatedly.
    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            &self.vms,
            &self.disks,
            &self.isos,
            &self.snapshots,
            &self.logs,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        info!(
            vms = %self.vms.display(),
            disks = %self.disks.display(),
            isos = %self.isos.display(),
            snapshots = %self.snapshots.display(),
            "Storage directories ready"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let dirs = Directories::under(root.path());
        dirs.ensure().await.unwrap();
        dirs.ensure().await.unwrap();
        assert!(dirs.vms.is_dir());
        assert!(dirs.disks.is_dir());
        assert!(dirs.isos.is_dir());
        assert!(dirs.snapshots.is_dir());
        assert!(dirs.logs.is_dir());
    }
}
