//! In-memory stand-in for `qemu-img`.
//!
//! Each image file holds its own [`ImageInfo`] as JSON, so renames and
//! deletes done by the managers behave exactly as they would on real images.
//! Flat vmdk images get a separate `-flat.vmdk` extent, like `qemu-img`
//! writes, and are unreadable once that extent goes missing.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{GIB, ImageInfo, ImageTool};
use crate::error::{NodeError, Result};
use crate::model::DiskFormat;

const SPARSE_ACTUAL_SIZE: u64 = 196 * 1024;

#[derive(Default)]
pub struct FakeImageTool {
    /// Every invocation, rendered like a command line.
    calls: Mutex<Vec<String>>,
}

impl FakeImageTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub async fn write_image(path: &Path, info: &ImageInfo) -> Result<()> {
        tokio::fs::write(path, serde_json::to_vec(info)?).await?;
        Ok(())
    }

    fn flat_extent(path: &Path) -> Option<PathBuf> {
        let stem = path.file_stem()?.to_str()?;
        Some(path.with_file_name(format!("{stem}-flat.vmdk")))
    }

    async fn read_image(path: &Path) -> Result<ImageInfo> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            NodeError::ExternalTool(format!("Could not open '{}': {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|_| {
            NodeError::ExternalTool(format!(
                "Could not open '{}': Image is not in a known format",
                path.display()
            ))
        })
    }

    async fn read_checked(path: &Path) -> Result<ImageInfo> {
        let info = Self::read_image(path).await?;
        if info.create_type.as_deref() == Some("monolithicFlat")
            && let Some(extent) = Self::flat_extent(path)
            && !tokio::fs::try_exists(&extent).await?
        {
            return Err(NodeError::ExternalTool(format!(
                "Could not open '{}': No such file or directory",
                extent.display()
            )));
        }
        Ok(info)
    }
}

#[async_trait]
impl ImageTool for FakeImageTool {
    async fn create(
        &self,
        path: &Path,
        format: DiskFormat,
        size_gb: u64,
        options: &[String],
    ) -> Result<()> {
        self.record(format!(
            "create -f {format} -o {} {} {size_gb}G",
            options.join(","),
            path.display()
        ));
        let virtual_size = size_gb * GIB;
        let fixed = options.iter().any(|o| o == "preallocation=full") || format == DiskFormat::Raw;
        let info = ImageInfo {
            format: format.to_string(),
            virtual_size,
            actual_size: Some(if fixed {
                virtual_size
            } else {
                SPARSE_ACTUAL_SIZE
            }),
            create_type: options
                .iter()
                .find_map(|o| o.strip_prefix("subformat="))
                .map(String::from),
        };
        if format == DiskFormat::Vmdk
            && info.create_type.as_deref() == Some("monolithicFlat")
            && let Some(extent) = Self::flat_extent(path)
        {
            let data = ImageInfo {
                format: DiskFormat::Raw.to_string(),
                virtual_size,
                actual_size: Some(virtual_size),
                create_type: None,
            };
            Self::write_image(&extent, &data).await?;
        }
        Self::write_image(path, &info).await
    }

    async fn info(&self, path: &Path) -> Result<ImageInfo> {
        self.record(format!("info {}", path.display()));
        Self::read_checked(path).await
    }

    async fn resize(&self, path: &Path, format: DiskFormat, size_gb: u64) -> Result<()> {
        self.record(format!("resize -f {format} {} {size_gb}G", path.display()));
        let mut info = Self::read_checked(path).await?;
        info.virtual_size = size_gb * GIB;
        Self::write_image(path, &info).await
    }

    async fn create_overlay(
        &self,
        overlay: &Path,
        backing: &Path,
        backing_format: DiskFormat,
    ) -> Result<()> {
        self.record(format!(
            "create -f qcow2 -F {backing_format} -b {} {}",
            backing.display(),
            overlay.display()
        ));
        let base = Self::read_checked(backing).await?;
        let info = ImageInfo {
            format: "qcow2".into(),
            virtual_size: base.virtual_size,
            actual_size: Some(SPARSE_ACTUAL_SIZE),
            create_type: None,
        };
        Self::write_image(overlay, &info).await
    }
}
