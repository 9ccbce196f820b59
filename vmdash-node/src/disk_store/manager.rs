use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{NodeError, Result};
use crate::image_tool::{GIB, ImageInfo, ImageTool, creation_options};
use crate::locks::KeyedLocks;
use crate::model::{Allocation, Disk, DiskFormat, is_safe_name};

/// Extensions tried, in order, when a VM references a disk by name.
pub const RESOLVE_ORDER: [&str; 4] = ["qcow2", "img", "raw", "vmdk"];

const FLAT_EXTENT_SUFFIX: &str = "-flat.vmdk";

/// The data file `qemu-img` writes next to a `monolithicFlat` descriptor.
fn flat_extent(descriptor: &Path) -> Option<PathBuf> {
    let name = descriptor.file_name()?.to_str()?;
    if name.ends_with(FLAT_EXTENT_SUFFIX) {
        return None;
    }
    let stem = name.strip_suffix(".vmdk")?;
    Some(descriptor.with_file_name(format!("{stem}{FLAT_EXTENT_SUFFIX}")))
}

async fn existing_extent(descriptor: &Path) -> Result<Option<PathBuf>> {
    match flat_extent(descriptor) {
        Some(extent) if tokio::fs::try_exists(&extent).await? => Ok(Some(extent)),
        _ => Ok(None),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct DiskUpdate {
    pub name: Option<String>,
    pub size_gb: Option<u64>,
}

/// Owns the disk image directory.
pub struct DiskManager {
    disk_dir: PathBuf,
    tool: Arc<dyn ImageTool>,
    locks: KeyedLocks,
}

impl DiskManager {
    pub fn new(disk_dir: impl Into<PathBuf>, tool: Arc<dyn ImageTool>) -> Self {
        Self {
            disk_dir: disk_dir.into(),
            tool,
            locks: KeyedLocks::new(),
        }
    }

    pub fn disk_dir(&self) -> &Path {
        &self.disk_dir
    }

    fn path_for(&self, filename: &str) -> Result<PathBuf> {
        if !is_safe_name(filename) {
            return Err(NodeError::invalid(format!("invalid disk name '{filename}'")));
        }
        Ok(self.disk_dir.join(filename))
    }

    #[instrument(skip(self))]
    pub async fn create(
        &self,
        name: &str,
        size_gb: u64,
        format: DiskFormat,
        allocation: Allocation,
    ) -> Result<Disk> {
        if !format.supports(allocation) {
            return Err(NodeError::invalid(format!(
                "{format} disks do not support {allocation} allocation"
            )));
        }
        if size_gb == 0 {
            return Err(NodeError::invalid("disk size must be positive"));
        }

        let filename = format!("{name}.{}", format.extension());
        let path = self.path_for(&filename)?;
        let _guard = self.locks.lock(&filename).await;

        if tokio::fs::try_exists(&path).await? {
            return Err(NodeError::Conflict(format!("disk {filename} already exists")));
        }

        let options = creation_options(format, allocation);
        self.tool.create(&path, format, size_gb, &options).await?;
        info!(disk = %filename, size_gb, %format, %allocation, "Disk created");

        self.describe(&path).await
    }

    /// Probe every image in the disk directory. Unreadable images are skipped.
    pub async fn list(&self) -> Result<Vec<Disk>> {
        let mut disks = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.disk_dir).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            if entry_name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(stem) = entry_name.strip_suffix(FLAT_EXTENT_SUFFIX)
                && tokio::fs::try_exists(self.disk_dir.join(format!("{stem}.vmdk"))).await?
            {
                continue;
            }
            match self.describe(&path).await {
                Ok(disk) => disks.push(disk),
                Err(e) => warn!("Skipping disk {}: {}", path.display(), e),
            }
        }

        disks.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(disks)
    }

    pub async fn get(&self, filename: &str) -> Result<Disk> {
        let path = self.existing(filename).await?;
        self.describe(&path).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, filename: &str) -> Result<()> {
        let path = self.path_for(filename)?;
        let _guard = self.locks.lock(filename).await;
        let extent = existing_extent(&path).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                if let Some(extent) = extent {
                    tokio::fs::remove_file(&extent).await?;
                }
                info!(disk = %filename, "Disk deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::not_found(format!("disk {filename}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rename and/or grow a disk. Resize is validated before anything moves.
    #[instrument(skip(self))]
    pub async fn update(&self, filename: &str, update: DiskUpdate) -> Result<Disk> {
        let mut path = self.path_for(filename)?;

        let target = match update.name.as_deref() {
            Some(name) => {
                let new_filename = match path.extension() {
                    Some(ext) => format!("{name}.{}", ext.to_string_lossy()),
                    None => name.to_string(),
                };
                (new_filename != filename).then_some(new_filename)
            }
            None => None,
        };

        let mut keys = vec![filename.to_string()];
        keys.extend(target.clone());
        keys.sort();
        let mut _guards = Vec::with_capacity(keys.len());
        for key in &keys {
            _guards.push(self.locks.lock(key).await);
        }

        if !tokio::fs::try_exists(&path).await? {
            return Err(NodeError::not_found(format!("disk {filename}")));
        }

        let resize = match update.size_gb {
            Some(size_gb) => {
                let info = self.tool.info(&path).await?;
                let format = Self::format_of(&info)?;
                if !format.resizable() {
                    return Err(NodeError::invalid(format!(
                        "{format} disks cannot be resized"
                    )));
                }
                let requested = size_gb.saturating_mul(GIB);
                if requested <= info.virtual_size {
                    return Err(NodeError::invalid(format!(
                        "new size {size_gb}G must be larger than the current {} bytes; shrinking is not supported",
                        info.virtual_size
                    )));
                }
                Some((format, size_gb))
            }
            None => None,
        };

        if let Some(new_filename) = target {
            let new_path = self.path_for(&new_filename)?;
            if tokio::fs::try_exists(&new_path).await? {
                return Err(NodeError::Conflict(format!(
                    "disk {new_filename} already exists"
                )));
            }
            let extent = match existing_extent(&path).await? {
                Some(extent) => {
                    let new_extent = flat_extent(&new_path).ok_or_else(|| {
                        NodeError::invalid(format!("cannot rename {filename} to {new_filename}"))
                    })?;
                    if tokio::fs::try_exists(&new_extent).await? {
                        return Err(NodeError::Conflict(format!(
                            "disk extent {} already exists",
                            file_name(&new_extent)
                        )));
                    }
                    Some((extent, new_extent))
                }
                None => None,
            };
            if let Some((extent, new_extent)) = &extent {
                tokio::fs::rename(extent, new_extent).await?;
            }
            tokio::fs::rename(&path, &new_path).await?;
            if let Some((extent, new_extent)) = &extent {
                Self::repoint_descriptor(&new_path, &file_name(extent), &file_name(new_extent))
                    .await?;
            }
            info!(from = %filename, to = %new_filename, "Disk renamed");
            path = new_path;
        }

        if let Some((format, size_gb)) = resize {
            self.tool.resize(&path, format, size_gb).await?;
            info!(disk = %path.display(), size_gb, "Disk resized");
        }

        self.describe(&path).await
    }

    /// Find the image a VM refers to by stem, honouring [`RESOLVE_ORDER`].
    pub async fn resolve(&self, name: &str) -> Result<PathBuf> {
        if !is_safe_name(name) {
            return Err(NodeError::invalid(format!("invalid disk name '{name}'")));
        }
        for ext in RESOLVE_ORDER {
            let candidate = self.disk_dir.join(format!("{name}.{ext}"));
            if tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(NodeError::not_found(format!("disk {name}")))
    }

    pub async fn probe(&self, path: &Path) -> Result<(DiskFormat, ImageInfo)> {
        let info = self.tool.info(path).await?;
        let format = Self::format_of(&info)?;
        Ok((format, info))
    }

    async fn existing(&self, filename: &str) -> Result<PathBuf> {
        let path = self.path_for(filename)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(NodeError::not_found(format!("disk {filename}")));
        }
        Ok(path)
    }

    async fn describe(&self, path: &Path) -> Result<Disk> {
        let (format, info) = self.probe(path).await?;
        let filename = file_name(path);
        let name = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Disk {
            name,
            filename,
            format,
            size: info.virtual_size / GIB,
            virtual_size_bytes: info.virtual_size,
            actual_size_bytes: info.actual_size,
            allocation: info.allocation(format),
        })
    }

    /// Point a flat vmdk descriptor at its renamed extent.
    async fn repoint_descriptor(descriptor: &Path, old: &str, new: &str) -> Result<()> {
        let bytes = tokio::fs::read(descriptor).await?;
        let Ok(text) = String::from_utf8(bytes) else {
            return Ok(());
        };
        let quoted = format!("\"{old}\"");
        if text.contains(&quoted) {
            tokio::fs::write(descriptor, text.replace(&quoted, &format!("\"{new}\""))).await?;
        }
        Ok(())
    }

    fn format_of(info: &ImageInfo) -> Result<DiskFormat> {
        info.disk_format().ok_or_else(|| {
            NodeError::ExternalTool(format!("unsupported image format '{}'", info.format))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_tool::fake::FakeImageTool;

    fn manager(dir: &Path) -> DiskManager {
        DiskManager::new(dir, Arc::new(FakeImageTool::new()))
    }

    #[tokio::test]
    async fn created_disks_report_what_was_requested() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());

        for format in DiskFormat::ALL {
            for allocation in [Allocation::Dynamic, Allocation::Fixed] {
                let name = format!("{format}-{allocation}");
                let result = disks.create(&name, 1, format, allocation).await;
                if format.supports(allocation) {
                    let disk = result.unwrap();
                    assert_eq!(disk.format, format);
                    assert_eq!(disk.allocation, allocation, "{name}");
                    assert_eq!(disk.size, 1);
                } else {
                    assert!(matches!(result, Err(NodeError::InvalidArgument(_))));
                    let leftover = dir.path().join(format!("{name}.{}", format.extension()));
                    assert!(!leftover.exists());
                }
            }
        }

        let listed = disks.list().await.unwrap();
        assert_eq!(listed.len(), 7);
        for disk in listed {
            assert!(disk.format.supports(disk.allocation));
            assert_eq!(disk.name, format!("{}-{}", disk.format, disk.allocation));
        }
    }

    #[tokio::test]
    async fn zero_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path())
            .create("zero", 0, DiskFormat::Qcow2, Allocation::Dynamic)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        disks
            .create("dup", 1, DiskFormat::Qcow2, Allocation::Dynamic)
            .await
            .unwrap();
        let err = disks
            .create("dup", 2, DiskFormat::Qcow2, Allocation::Dynamic)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_skips_unprobeable_files() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        disks
            .create("good", 2, DiskFormat::Qcow2, Allocation::Dynamic)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("junk.bin"), b"not an image")
            .await
            .unwrap();

        let listed = disks.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "good.qcow2");
    }

    #[tokio::test]
    async fn resolve_follows_extension_priority() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        for ext in ["vmdk", "raw", "img"] {
            tokio::fs::write(dir.path().join(format!("base.{ext}")), b"")
                .await
                .unwrap();
        }
        assert_eq!(disks.resolve("base").await.unwrap(), dir.path().join("base.img"));

        tokio::fs::write(dir.path().join("base.qcow2"), b"").await.unwrap();
        assert_eq!(disks.resolve("base").await.unwrap(), dir.path().join("base.qcow2"));

        assert!(matches!(
            disks.resolve("missing").await,
            Err(NodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resize_only_grows() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        disks
            .create("grow", 10, DiskFormat::Qcow2, Allocation::Dynamic)
            .await
            .unwrap();

        for size in [5, 10] {
            let err = disks
                .update(
                    "grow.qcow2",
                    DiskUpdate {
                        name: None,
                        size_gb: Some(size),
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, NodeError::InvalidArgument(_)));
        }

        let disk = disks
            .update(
                "grow.qcow2",
                DiskUpdate {
                    name: None,
                    size_gb: Some(20),
                },
            )
            .await
            .unwrap();
        assert!(disk.size >= 20);
    }

    #[tokio::test]
    async fn vdi_cannot_be_resized() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        disks
            .create("old", 1, DiskFormat::Vdi, Allocation::Dynamic)
            .await
            .unwrap();
        let err = disks
            .update(
                "old.vdi",
                DiskUpdate {
                    name: None,
                    size_gb: Some(4),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn rename_collision_leaves_both_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        disks
            .create("a", 1, DiskFormat::Qcow2, Allocation::Dynamic)
            .await
            .unwrap();
        disks
            .create("b", 2, DiskFormat::Qcow2, Allocation::Dynamic)
            .await
            .unwrap();
        let before_a = tokio::fs::read(dir.path().join("a.qcow2")).await.unwrap();
        let before_b = tokio::fs::read(dir.path().join("b.qcow2")).await.unwrap();

        let err = disks
            .update(
                "a.qcow2",
                DiskUpdate {
                    name: Some("b".into()),
                    size_gb: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Conflict(_)));
        assert_eq!(tokio::fs::read(dir.path().join("a.qcow2")).await.unwrap(), before_a);
        assert_eq!(tokio::fs::read(dir.path().join("b.qcow2")).await.unwrap(), before_b);
    }

    #[tokio::test]
    async fn rename_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        disks
            .create("before", 1, DiskFormat::Vmdk, Allocation::Fixed)
            .await
            .unwrap();
        let disk = disks
            .update(
                "before.vmdk",
                DiskUpdate {
                    name: Some("after".into()),
                    size_gb: Some(3),
                },
            )
            .await
            .unwrap();
        assert_eq!(disk.filename, "after.vmdk");
        assert_eq!(disk.size, 3);
        assert_eq!(disk.allocation, Allocation::Fixed);
        assert!(!dir.path().join("before.vmdk").exists());
    }

    #[tokio::test]
    async fn flat_vmdk_extent_follows_its_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        disks
            .create("flat", 1, DiskFormat::Vmdk, Allocation::Fixed)
            .await
            .unwrap();
        assert!(dir.path().join("flat-flat.vmdk").exists());

        let listed = disks.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "flat.vmdk");

        disks
            .update(
                "flat.vmdk",
                DiskUpdate {
                    name: Some("moved".into()),
                    size_gb: None,
                },
            )
            .await
            .unwrap();
        assert!(dir.path().join("moved-flat.vmdk").exists());
        assert!(!dir.path().join("flat-flat.vmdk").exists());
        assert_eq!(disks.get("moved.vmdk").await.unwrap().allocation, Allocation::Fixed);

        disks.delete("moved.vmdk").await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renamed_descriptor_points_at_the_new_extent() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("new.vmdk");
        tokio::fs::write(
            &descriptor,
            "# Disk DescriptorFile\nversion=1\ncreateType=\"monolithicFlat\"\n\n# Extent description\nRW 2097152 FLAT \"old-flat.vmdk\" 0\n",
        )
        .await
        .unwrap();

        DiskManager::repoint_descriptor(&descriptor, "old-flat.vmdk", "new-flat.vmdk")
            .await
            .unwrap();
        let text = tokio::fs::read_to_string(&descriptor).await.unwrap();
        assert!(text.contains("RW 2097152 FLAT \"new-flat.vmdk\" 0"), "{text}");
        assert!(!text.contains("old-flat.vmdk"));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let disks = manager(dir.path());
        assert!(matches!(
            disks.delete("nope.qcow2").await,
            Err(NodeError::NotFound(_))
        ));
        assert!(matches!(
            disks.delete("../escape").await,
            Err(NodeError::InvalidArgument(_))
        ));
    }
}
