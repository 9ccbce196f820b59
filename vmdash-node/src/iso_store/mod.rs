//! Installation media repository.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use crate::error::{NodeError, Result};
use crate::locks::KeyedLocks;
use crate::model::{Iso, is_safe_name};

const ISO_EXTENSION: &str = ".iso";

pub struct IsoRepository {
    iso_dir: PathBuf,
    locks: KeyedLocks,
}

fn has_iso_extension(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(ISO_EXTENSION)
}

/// Size as shown in the dashboard, e.g. "12.50 MB".
pub fn format_size_mb(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

impl IsoRepository {
    pub fn new(iso_dir: impl Into<PathBuf>) -> Self {
        Self {
            iso_dir: iso_dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if !is_safe_name(name) {
            return Err(NodeError::invalid(format!("invalid ISO name '{name}'")));
        }
        Ok(self.iso_dir.join(name))
    }

    fn upload_path_for(&self, name: &str) -> Result<PathBuf> {
        if !has_iso_extension(name) {
            return Err(NodeError::invalid(format!(
                "'{name}' is not an ISO image (expected a {ISO_EXTENSION} file)"
            )));
        }
        self.path_for(name)
    }

    /// Path of an existing ISO, used when attaching media to a VM.
    pub async fn existing(&self, name: &str) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(NodeError::not_found(format!("ISO {name}")));
        }
        Ok(path)
    }

    pub async fn list(&self) -> Result<Vec<Iso>> {
        let mut isos = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.iso_dir).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !has_iso_extension(&name) || name.starts_with('.') {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping ISO {}: {}", name, e);
                    continue;
                }
            };
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            isos.push(Iso {
                name,
                size_bytes: metadata.len(),
                size: format_size_mb(metadata.len()),
                modified,
            });
        }

        isos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(isos)
    }

    pub async fn upload(&self, name: &str, content: &[u8]) -> Result<Iso> {
        let chunk = Bytes::copy_from_slice(content);
        self.upload_stream(name, futures::stream::iter([Ok::<_, std::io::Error>(chunk)]))
            .await
    }

    /// Stream an upload to disk. Replaces any ISO with the same name only once
    /// the whole body has been written.
    #[instrument(skip(self, body))]
    pub async fn upload_stream<S, E>(&self, name: &str, body: S) -> Result<Iso>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let path = self.upload_path_for(name)?;
        let partial = self.iso_dir.join(format!(".{name}.part"));
        let _guard = self.locks.lock(name).await;

        let written = match Self::write_body(&partial, body).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &path).await?;
        info!(iso = %name, bytes = written, "ISO stored");

        let metadata = tokio::fs::metadata(&path).await?;
        Ok(Iso {
            name: name.to_string(),
            size_bytes: metadata.len(),
            size: format_size_mb(metadata.len()),
            modified: metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    async fn write_body<S, E>(partial: &Path, body: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut file = tokio::fs::File::create(partial).await?;
        let mut written = 0u64;
        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| NodeError::invalid(format!("upload interrupted: {e}")))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        let _guard = self.locks.lock(name).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(iso = %name, "ISO deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::not_found(format!("ISO {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let repo = IsoRepository::new(dir.path());

        let iso = repo.upload("x.iso", &[0u8; 2048]).await.unwrap();
        assert_eq!(iso.size_bytes, 2048);
        assert!(iso.size.ends_with(" MB"));

        let listed = repo.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "x.iso");

        repo.delete("x.iso").await.unwrap();
        assert!(repo.list().await.unwrap().is_empty());
        assert!(matches!(
            repo.delete("x.iso").await,
            Err(NodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn same_name_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let repo = IsoRepository::new(dir.path());
        repo.upload("disc.iso", b"first").await.unwrap();
        repo.upload("disc.iso", b"second!").await.unwrap();

        let listed = repo.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size_bytes, 7);
    }

    #[tokio::test]
    async fn rejects_non_iso_names() {
        let dir = tempfile::tempdir().unwrap();
        let repo = IsoRepository::new(dir.path());
        for name in ["notes.txt", "../evil.iso", "iso"] {
            assert!(matches!(
                repo.upload(name, b"data").await,
                Err(NodeError::InvalidArgument(_))
            ));
        }
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let repo = IsoRepository::new(dir.path());
        let body = futures::stream::iter([
            Ok(Bytes::from_static(b"partial")),
            Err("connection reset"),
        ]);

        let err = repo.upload_stream("broken.iso", body).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(_)));
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("readme.txt"), b"hi")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("UPPER.ISO"), b"iso")
            .await
            .unwrap();
        let repo = IsoRepository::new(dir.path());
        let listed = repo.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "UPPER.ISO");
        assert_eq!(format_size_mb(1024 * 1024), "1.00 MB");
    }
}
