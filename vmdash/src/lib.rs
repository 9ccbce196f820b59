pub mod configuration;
pub mod errors;
pub mod handlers;
pub mod model;
pub mod startup;

use std::sync::Arc;

use vmdash_node::disk_store::DiskManager;
use vmdash_node::image_tool::ImageTool;
use vmdash_node::iso_store::IsoRepository;
use vmdash_node::layout::Directories;
use vmdash_node::qemu::{QemuSettings, VmSupervisor};
use vmdash_node::snapshot::SnapshotEngine;
use vmdash_node::state::StateStore;

#[derive(Clone)]
pub struct App {
    vms: Arc<VmSupervisor>,
    disks: Arc<DiskManager>,
    isos: Arc<IsoRepository>,
    snapshots: Arc<SnapshotEngine>,
    max_upload_bytes: usize,
}

impl App {
    /// Create the storage directories and wire up every component.
    pub async fn open(
        dirs: &Directories,
        qemu: QemuSettings,
        image_tool: Arc<dyn ImageTool>,
        max_upload_bytes: usize,
    ) -> vmdash_node::Result<Self> {
        dirs.ensure().await?;

        let store = Arc::new(StateStore::open(&dirs.vms).await?);
        let disks = Arc::new(DiskManager::new(&dirs.disks, image_tool.clone()));
        let isos = Arc::new(IsoRepository::new(&dirs.isos));
        let snapshots = Arc::new(SnapshotEngine::new(
            &dirs.snapshots,
            store.clone(),
            image_tool,
        ));
        let vms = Arc::new(VmSupervisor::new(
            qemu,
            dirs,
            store,
            disks.clone(),
            isos.clone(),
        ));

        Ok(Self {
            vms,
            disks,
            isos,
            snapshots,
            max_upload_bytes,
        })
    }

    pub fn vms(&self) -> &VmSupervisor {
        &self.vms
    }

    pub fn disks(&self) -> &DiskManager {
        &self.disks
    }

    pub fn isos(&self) -> &IsoRepository {
        &self.isos
    }

    pub fn snapshots(&self) -> &SnapshotEngine {
        &self.snapshots
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }
}
