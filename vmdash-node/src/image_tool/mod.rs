//! Disk image tooling.
//!
//! Everything that touches image internals goes through [`ImageTool`] so the
//! managers never build `qemu-img` command lines themselves.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};
use crate::model::{Allocation, DiskFormat};

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// What the info probe reports about an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub format: String,
    pub virtual_size: u64,
    pub actual_size: Option<u64>,
    /// vmdk subformat, e.g. `monolithicFlat`.
    pub create_type: Option<String>,
}

impl ImageInfo {
    pub fn disk_format(&self) -> Option<DiskFormat> {
        self.format.parse().ok()
    }

    /// Infer how the image was allocated from what the probe can see.
    pub fn allocation(&self, format: DiskFormat) -> Allocation {
        match format {
            DiskFormat::Qcow2 => match self.actual_size {
                // Full preallocation leaves every cluster backed on disk.
                Some(actual) if actual >= self.virtual_size => Allocation::Fixed,
                _ => Allocation::Dynamic,
            },
            DiskFormat::Vmdk => match self.create_type.as_deref() {
                Some("monolithicFlat") => Allocation::Fixed,
                _ => Allocation::Dynamic,
            },
            DiskFormat::Raw => Allocation::Fixed,
            DiskFormat::Vdi | DiskFormat::Vpc => Allocation::Dynamic,
        }
    }
}

#[derive(Deserialize)]
struct RawInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "actual-size")]
    actual_size: Option<u64>,
    #[serde(rename = "format-specific")]
    format_specific: Option<FormatSpecific>,
}

#[derive(Deserialize)]
struct FormatSpecific {
    data: Option<serde_json::Value>,
}

/// Parse `qemu-img info --output json`.
pub fn parse_info(json: &[u8]) -> Result<ImageInfo> {
    let raw: RawInfo = serde_json::from_slice(json)
        .map_err(|e| NodeError::ExternalTool(format!("unreadable image info: {e}")))?;
    let create_type = raw
        .format_specific
        .and_then(|f| f.data)
        .and_then(|d| d.get("create-type").and_then(|t| t.as_str()).map(String::from));
    Ok(ImageInfo {
        format: raw.format,
        virtual_size: raw.virtual_size,
        actual_size: raw.actual_size,
        create_type,
    })
}

/// `-o` options for a (format, allocation) pair. Callers must have checked
/// the pair against [`DiskFormat::supports`].
pub fn creation_options(format: DiskFormat, allocation: Allocation) -> Vec<String> {
    creation_options_for(format, allocation, !cfg!(windows))
}

fn creation_options_for(
    format: DiskFormat,
    allocation: Allocation,
    full_preallocation: bool,
) -> Vec<String> {
    match (format, allocation) {
        (DiskFormat::Qcow2, Allocation::Fixed) if full_preallocation => {
            vec!["preallocation=full".into()]
        }
        (DiskFormat::Qcow2, Allocation::Fixed) => {
            warn!("Full preallocation is not supported on this platform, using metadata");
            vec!["preallocation=metadata".into()]
        }
        (DiskFormat::Qcow2, Allocation::Dynamic) => vec!["preallocation=metadata".into()],
        (DiskFormat::Vmdk, Allocation::Fixed) => vec!["subformat=monolithicFlat".into()],
        (DiskFormat::Vmdk, Allocation::Dynamic) => vec!["subformat=streamOptimized".into()],
        _ => Vec::new(),
    }
}

#[async_trait]
pub trait ImageTool: Send + Sync {
    async fn create(
        &self,
        path: &Path,
        format: DiskFormat,
        size_gb: u64,
        options: &[String],
    ) -> Result<()>;

    async fn info(&self, path: &Path) -> Result<ImageInfo>;

    async fn resize(&self, path: &Path, format: DiskFormat, size_gb: u64) -> Result<()>;

    /// Create a qcow2 image at `overlay` whose backing file is `backing`.
    async fn create_overlay(
        &self,
        overlay: &Path,
        backing: &Path,
        backing_format: DiskFormat,
    ) -> Result<()>;
}

/// [`ImageTool`] backed by the `qemu-img` binary.
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, command: &mut Command) -> Result<Output> {
        let output = command.output().await.map_err(|e| {
            NodeError::ExternalTool(format!("failed to run {}: {e}", self.binary.display()))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(NodeError::ExternalTool(if stderr.is_empty() {
                format!("{} exited with {}", self.binary.display(), output.status)
            } else {
                stderr
            }));
        }
        Ok(output)
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    async fn create(
        &self,
        path: &Path,
        format: DiskFormat,
        size_gb: u64,
        options: &[String],
    ) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command.arg("create").arg("-f").arg(format.to_string());
        if !options.is_empty() {
            command.arg("-o").arg(options.join(","));
        }
        command.arg(path).arg(format!("{size_gb}G"));
        debug!(path = %path.display(), %format, size_gb, ?options, "Creating image");
        self.run(&mut command).await?;
        Ok(())
    }

    async fn info(&self, path: &Path) -> Result<ImageInfo> {
        let output = self
            .run(
                Command::new(&self.binary)
                    .args(["info", "--output", "json"])
                    .arg(path),
            )
            .await?;
        parse_info(&output.stdout)
    }

    async fn resize(&self, path: &Path, format: DiskFormat, size_gb: u64) -> Result<()> {
        self.run(
            Command::new(&self.binary)
                .arg("resize")
                .arg("-f")
                .arg(format.to_string())
                .arg(path)
                .arg(format!("{size_gb}G")),
        )
        .await?;
        Ok(())
    }

    async fn create_overlay(
        &self,
        overlay: &Path,
        backing: &Path,
        backing_format: DiskFormat,
    ) -> Result<()> {
        self.run(
            Command::new(&self.binary)
                .args(["create", "-f", "qcow2", "-F"])
                .arg(backing_format.to_string())
                .arg("-b")
                .arg(backing)
                .arg(overlay),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QCOW2_INFO: &str = r#"{
        "virtual-size": 10737418240,
        "filename": "test.qcow2",
        "cluster-size": 65536,
        "format": "qcow2",
        "actual-size": 200704,
        "format-specific": {
            "type": "qcow2",
            "data": { "compat": "1.1", "lazy-refcounts": false, "refcount-bits": 16, "corrupt": false }
        },
        "dirty-flag": false
    }"#;

    const VMDK_INFO: &str = r#"{
        "virtual-size": 5368709120,
        "filename": "flat.vmdk",
        "format": "vmdk",
        "actual-size": 5368713216,
        "format-specific": {
            "type": "vmdk",
            "data": { "cid": 1, "parent-cid": 4294967295, "create-type": "monolithicFlat", "extents": [] }
        }
    }"#;

    #[test]
    fn parses_qcow2_info() {
        let info = parse_info(QCOW2_INFO.as_bytes()).unwrap();
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.virtual_size, 10 * GIB);
        assert_eq!(info.actual_size, Some(200704));
        assert_eq!(info.create_type, None);
        assert_eq!(info.disk_format(), Some(DiskFormat::Qcow2));
        assert_eq!(info.allocation(DiskFormat::Qcow2), Allocation::Dynamic);
    }

    #[test]
    fn parses_vmdk_create_type() {
        let info = parse_info(VMDK_INFO.as_bytes()).unwrap();
        assert_eq!(info.create_type.as_deref(), Some("monolithicFlat"));
        assert_eq!(info.allocation(DiskFormat::Vmdk), Allocation::Fixed);
    }

    #[test]
    fn garbage_info_is_a_tool_error() {
        assert!(matches!(
            parse_info(b"image: foo\nfile format: raw"),
            Err(NodeError::ExternalTool(_))
        ));
    }

    #[test]
    fn allocation_inference_per_format() {
        let mut info = ImageInfo {
            format: "qcow2".into(),
            virtual_size: GIB,
            actual_size: Some(GIB + 4096),
            create_type: None,
        };
        assert_eq!(info.allocation(DiskFormat::Qcow2), Allocation::Fixed);
        info.actual_size = None;
        assert_eq!(info.allocation(DiskFormat::Qcow2), Allocation::Dynamic);
        assert_eq!(info.allocation(DiskFormat::Raw), Allocation::Fixed);
        assert_eq!(info.allocation(DiskFormat::Vdi), Allocation::Dynamic);
        assert_eq!(info.allocation(DiskFormat::Vpc), Allocation::Dynamic);
        info.create_type = Some("streamOptimized".into());
        assert_eq!(info.allocation(DiskFormat::Vmdk), Allocation::Dynamic);
    }

    #[test]
    fn option_mapping() {
        use Allocation::*;
        use DiskFormat::*;

        assert_eq!(creation_options_for(Qcow2, Fixed, true), ["preallocation=full"]);
        assert_eq!(creation_options_for(Qcow2, Fixed, false), ["preallocation=metadata"]);
        assert_eq!(creation_options_for(Qcow2, Dynamic, true), ["preallocation=metadata"]);
        assert_eq!(creation_options_for(Vmdk, Fixed, true), ["subformat=monolithicFlat"]);
        assert_eq!(creation_options_for(Vmdk, Dynamic, true), ["subformat=streamOptimized"]);
        assert!(creation_options_for(Raw, Fixed, true).is_empty());
        assert!(creation_options_for(Vdi, Dynamic, true).is_empty());
        assert!(creation_options_for(Vpc, Dynamic, true).is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_tool_error() {
        let tool = QemuImg::new("/nonexistent/qemu-img");
        let err = tool.info(Path::new("/tmp/x.qcow2")).await.unwrap_err();
        assert!(matches!(err, NodeError::ExternalTool(_)));
    }

    /// Writes a `qemu-img` stand-in that runs `body` with `$LOG` pointing at
    /// a file next to it.
    async fn stub_tool(dir: &Path, body: &str) -> (QemuImg, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("qemu-img");
        tokio::fs::write(
            &script,
            format!("#!/bin/sh
LOG='{}'
{body}
", log.display()),
        )
        .await
        .unwrap();
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();
        (QemuImg::new(script), log)
    }

    #[tokio::test]
    async fn command_lines_match_qemu_img() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, log) = stub_tool(dir.path(), "echo \"$@\" >> \"$LOG\"").await;
        let disk = dir.path().join("d.qcow2");
        let overlay = dir.path().join("d-snap.qcow2");

        tool.create(&disk, DiskFormat::Qcow2, 4, &["preallocation=metadata".into()])
            .await
            .unwrap();
        tool.create(&dir.path().join("r.raw"), DiskFormat::Raw, 1, &[])
            .await
            .unwrap();
        tool.resize(&disk, DiskFormat::Qcow2, 8).await.unwrap();
        tool.create_overlay(&overlay, &disk, DiskFormat::Qcow2)
            .await
            .unwrap();

        let calls = tokio::fs::read_to_string(&log).await.unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        let d = disk.display();
        assert_eq!(
            calls,
            [
                format!("create -f qcow2 -o preallocation=metadata {d} 4G"),
                format!("create -f raw {}/r.raw 1G", dir.path().display()),
                format!("resize -f qcow2 {d} 8G"),
                format!("create -f qcow2 -F qcow2 -b {d} {}", overlay.display()),
            ]
        );
    }

    #[tokio::test]
    async fn failing_tool_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = stub_tool(
            dir.path(),
            "echo \"qemu-img: Could not resize: Operation not permitted\" >&2; exit 1",
        )
        .await;

        let err = tool
            .resize(&dir.path().join("d.qcow2"), DiskFormat::Qcow2, 8)
            .await
            .unwrap_err();
        match err {
            NodeError::ExternalTool(msg) => {
                assert_eq!(msg, "qemu-img: Could not resize: Operation not permitted")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_failure_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = stub_tool(dir.path(), "exit 3").await;
        let err = tool.info(&dir.path().join("d.qcow2")).await.unwrap_err();
        match err {
            NodeError::ExternalTool(msg) => assert!(msg.contains("exited with"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
