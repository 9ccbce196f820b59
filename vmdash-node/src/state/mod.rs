//! File-backed VM records, one JSON file per VM named after the VM.

pub mod reconcile;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{NodeError, Result};
use crate::model::VmRecord;

const RECORD_EXTENSION: &str = "json";

pub struct StateStore {
    dir: PathBuf,
    /// id -> name, so lookups by id do not scan the directory.
    index: RwLock<HashMap<Uuid, String>>,
}

impl StateStore {
    /// Open the store and index whatever records are already on disk.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            dir: dir.into(),
            index: RwLock::new(HashMap::new()),
        };
        let records = store.scan().await?;
        {
            let mut index = store.index.write().await;
            for record in &records {
                index.insert(record.id, record.name.clone());
            }
        }
        debug!(
            "Indexed {} VM records in {}",
            records.len(),
            store.dir.display()
        );
        Ok(store)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    async fn read_record(path: &Path) -> Result<VmRecord> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn scan(&self) -> Result<Vec<VmRecord>> {
        let mut records = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable VM record {}: {}", path.display(), e),
            }
        }

        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// All readable records, oldest first.
    pub async fn list(&self) -> Result<Vec<VmRecord>> {
        self.scan().await
    }

    pub async fn get(&self, id: Uuid) -> Result<VmRecord> {
        let indexed = self.index.read().await.get(&id).cloned();
        if let Some(name) = indexed {
            match Self::read_record(&self.path_for(&name)).await {
                Ok(record) if record.id == id => return Ok(record),
                Ok(_) | Err(NodeError::Io(_)) | Err(NodeError::Json(_)) => {
                    debug!("Index entry for VM {} is stale, rescanning", id);
                }
                Err(e) => return Err(e),
            }
        }

        // Records can be written by something other than this process.
        let records = self.scan().await?;
        let mut index = self.index.write().await;
        index.clear();
        let mut found = None;
        for record in records {
            index.insert(record.id, record.name.clone());
            if record.id == id {
                found = Some(record);
            }
        }
        found.ok_or_else(|| NodeError::not_found(format!("VM {id}")))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<VmRecord>> {
        match Self::read_record(&self.path_for(name)).await {
            Ok(record) => Ok(Some(record)),
            Err(NodeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the whole record. If the record was previously stored under a
    /// different name the old file is removed once the new one is in place.
    pub async fn put(&self, record: &VmRecord) -> Result<()> {
        let path = self.path_for(&record.name);
        let tmp = self.dir.join(format!(".{}.{RECORD_EXTENSION}.tmp", record.name));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let previous = self
            .index
            .write()
            .await
            .insert(record.id, record.name.clone());
        if let Some(old_name) = previous.filter(|old| *old != record.name)
            && let Err(e) = tokio::fs::remove_file(self.path_for(&old_name)).await
        {
            warn!("Failed to remove old record {}: {}", old_name, e);
        }
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<VmRecord> {
        let record = self.get(id).await?;
        match tokio::fs::remove_file(self.path_for(&record.name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NodeError::not_found(format!("VM {id}")));
            }
            Err(e) => return Err(e.into()),
        }
        self.index.write().await.remove(&id);
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{DiskFormat, Network, VmStatus};
    use chrono::Utc;

    pub(crate) fn record(name: &str) -> VmRecord {
        VmRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            cpus: 2,
            memory: "2 GB".into(),
            disk_name: "disk".into(),
            disk_path: PathBuf::from("/tmp/disk.qcow2"),
            disk_format: DiskFormat::Qcow2,
            iso: None,
            os: None,
            network: Network::default(),
            enable_kvm: false,
            enable_efi: false,
            custom_args: Vec::new(),
            pid: None,
            process_start_time: None,
            status: VmStatus::Stopped,
            started_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();

        let a = record("alpha");
        let b = record("beta");
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();
        assert!(dir.path().join("alpha.json").exists());

        assert_eq!(store.get(b.id).await.unwrap().name, "beta");
        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["alpha", "beta"]);

        store.delete(a.id).await.unwrap();
        assert!(matches!(store.get(a.id).await, Err(NodeError::NotFound(_))));
        assert!(matches!(store.delete(a.id).await, Err(NodeError::NotFound(_))));
    }

    #[tokio::test]
    async fn open_indexes_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let vm = record("persisted");
        {
            let store = StateStore::open(dir.path()).await.unwrap();
            store.put(&vm).await.unwrap();
        }
        let reopened = StateStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(vm.id).await.unwrap().name, "persisted");
    }

    #[tokio::test]
    async fn get_finds_records_written_behind_its_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        let vm = record("external");
        tokio::fs::write(
            dir.path().join("external.json"),
            serde_json::to_vec(&vm).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(store.get(vm.id).await.unwrap().name, "external");
    }

    #[tokio::test]
    async fn rename_moves_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        let mut vm = record("old");
        store.put(&vm).await.unwrap();
        vm.name = "new".into();
        store.put(&vm).await.unwrap();

        assert!(!dir.path().join("old.json").exists());
        assert!(dir.path().join("new.json").exists());
        assert_eq!(store.get(vm.id).await.unwrap().name, "new");
    }

    #[tokio::test]
    async fn list_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        store.put(&record("fine")).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{ nope")
            .await
            .unwrap();
        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "fine");
    }
}
