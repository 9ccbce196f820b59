//! Lifecycle of QEMU processes backed by persisted VM records.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Child;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::QemuSettings;
use super::args::{build_args, validate_bridge, validate_custom_args};
use crate::disk_store::DiskManager;
use crate::error::{NodeError, Result};
use crate::iso_store::IsoRepository;
use crate::layout::Directories;
use crate::locks::KeyedLocks;
use crate::model::{
    ActionOutcome, Allocation, DeleteOutcome, DiskFormat, Network, NetworkMode, VmPatch,
    VmRecord, VmSpec, VmStatus, VmView, format_memory, is_safe_name, parse_memory,
};
use crate::process;
use crate::state::StateStore;
use crate::state::reconcile::reconcile;

const ALREADY_STOPPED: &str = "process already stopped";
const NOT_RUNNING: &str = "process is not running";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_TAIL_BYTES: u64 = 64 * 1024;

/// Supervisor for QEMU VMs
pub struct VmSupervisor {
    settings: QemuSettings,
    logs_dir: PathBuf,
    store: Arc<StateStore>,
    disks: Arc<DiskManager>,
    isos: Arc<IsoRepository>,
    /// One lock per VM id, plus `name:<name>` entries while names are claimed.
    locks: KeyedLocks,
}

impl VmSupervisor {
    pub fn new(
        settings: QemuSettings,
        dirs: &Directories,
        store: Arc<StateStore>,
        disks: Arc<DiskManager>,
        isos: Arc<IsoRepository>,
    ) -> Self {
        info!(
            "VmSupervisor initialized: qemu={}, logs_dir={}",
            settings.binary.display(),
            dirs.logs.display()
        );
        Self {
            settings,
            logs_dir: dirs.logs.clone(),
            store,
            disks,
            isos,
            locks: KeyedLocks::new(),
        }
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir.join(format!("{name}.log"))
    }

    async fn lock_vm(&self, id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.lock(&id.to_string()).await
    }

    fn validate_name(name: &str) -> Result<()> {
        if !is_safe_name(name) {
            return Err(NodeError::invalid(format!(
                "invalid VM name '{name}': use letters, digits, '.', '_' or '-'"
            )));
        }
        Ok(())
    }

    fn validate_network(network: &Network) -> Result<()> {
        if network.mode == NetworkMode::Bridge
            && let Some(bridge) = &network.bridge
        {
            validate_bridge(bridge)?;
        }
        Ok(())
    }

    /// Resolve the disk, launch QEMU and persist the record.
    #[instrument(skip(self, spec), fields(vm = %spec.name))]
    pub async fn create(&self, spec: VmSpec) -> Result<VmView> {
        if spec.name.is_empty() {
            return Err(NodeError::invalid("name is required"));
        }
        Self::validate_name(&spec.name)?;
        if spec.cpus == 0 {
            return Err(NodeError::invalid("cpus must be at least 1"));
        }
        let memory = parse_memory(&spec.memory)
            .ok_or_else(|| NodeError::invalid(format!("invalid memory '{}'", spec.memory)))?;
        if spec.disk_name.is_empty() {
            return Err(NodeError::invalid("diskName is required"));
        }
        validate_custom_args(&spec.custom_args)?;
        Self::validate_network(&spec.network)?;

        let _name_guard = self.locks.lock(&format!("name:{}", spec.name)).await;
        if self.store.find_by_name(&spec.name).await?.is_some() {
            return Err(NodeError::Conflict(format!(
                "a VM named {} already exists",
                spec.name
            )));
        }

        if let Some(iso) = &spec.iso {
            self.isos.existing(iso).await?;
        }

        let mut created_disk = None;
        let disk_path = match (self.disks.resolve(&spec.disk_name).await, spec.disk_size_gb) {
            (Ok(path), _) => path,
            (Err(NodeError::NotFound(_)), Some(size_gb)) => {
                info!("Creating missing disk {} ({} GB)", spec.disk_name, size_gb);
                let disk = self
                    .disks
                    .create(&spec.disk_name, size_gb, DiskFormat::Qcow2, Allocation::Dynamic)
                    .await?;
                let path = self.disks.disk_dir().join(&disk.filename);
                created_disk = Some(disk.filename);
                path
            }
            (Err(e), _) => return Err(e),
        };

        let created = self.create_with_disk(spec, memory, disk_path).await;
        if created.is_err()
            && let Some(filename) = created_disk
            && let Err(e) = self.disks.delete(&filename).await
        {
            warn!("Failed to remove disk {} after a failed create: {}", filename, e);
        }
        created
    }

    async fn create_with_disk(
        &self,
        spec: VmSpec,
        memory: u64,
        disk_path: PathBuf,
    ) -> Result<VmView> {
        let (disk_format, info) = self.disks.probe(&disk_path).await?;
        if info.virtual_size == 0 {
            return Err(NodeError::ExternalTool(format!(
                "could not determine the size of {}",
                disk_path.display()
            )));
        }
        debug!(disk = %disk_path.display(), %disk_format, size = info.virtual_size, "Disk resolved");

        let mut record = VmRecord {
            id: Uuid::now_v7(),
            name: spec.name,
            cpus: spec.cpus,
            memory: format_memory(memory),
            disk_name: spec.disk_name,
            disk_path,
            disk_format,
            iso: spec.iso,
            os: spec.os,
            network: spec.network,
            enable_kvm: spec.enable_kvm,
            enable_efi: spec.enable_efi,
            custom_args: spec.custom_args,
            pid: None,
            process_start_time: None,
            status: VmStatus::Stopped,
            started_at: None,
            created_at: Utc::now(),
        };

        self.launch(&mut record).await?;
        self.store.put(&record).await?;
        info!(vm = %record.name, id = %record.id, pid = ?record.pid, "VM created");

        Ok(reconcile(record))
    }

    pub async fn list(&self) -> Result<Vec<VmView>> {
        let records = self.store.list().await?;
        Ok(records.into_iter().map(reconcile).collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<VmView> {
        Ok(reconcile(self.store.get(id).await?))
    }

    /// Merge `patch` into the record. Takes effect on the next start.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: Uuid, patch: VmPatch) -> Result<VmView> {
        let _guard = self.lock_vm(id).await;
        let mut record = self.store.get(id).await?;

        let rename = patch.name.filter(|n| *n != record.name);
        let _name_guard = match &rename {
            Some(name) => {
                Self::validate_name(name)?;
                Some(self.locks.lock(&format!("name:{name}")).await)
            }
            None => None,
        };
        let old_name = record.name.clone();
        if let Some(name) = rename {
            if self.store.find_by_name(&name).await?.is_some() {
                return Err(NodeError::Conflict(format!("a VM named {name} already exists")));
            }
            record.name = name;
        }
        if let Some(cpus) = patch.cpus {
            if cpus == 0 {
                return Err(NodeError::invalid("cpus must be at least 1"));
            }
            record.cpus = cpus;
        }
        if let Some(memory) = patch.memory {
            let mib = parse_memory(&memory)
                .ok_or_else(|| NodeError::invalid(format!("invalid memory '{memory}'")))?;
            record.memory = format_memory(mib);
        }
        if let Some(os) = patch.os {
            record.os = Some(os);
        }
        if let Some(iso) = patch.iso {
            if let Some(name) = &iso {
                self.isos.existing(name).await?;
            }
            record.iso = iso;
        }
        if let Some(network) = patch.network {
            Self::validate_network(&network)?;
            record.network = network;
        }
        if let Some(kvm) = patch.enable_kvm {
            record.enable_kvm = kvm;
        }
        if let Some(efi) = patch.enable_efi {
            record.enable_efi = efi;
        }
        if let Some(custom_args) = patch.custom_args {
            validate_custom_args(&custom_args)?;
            record.custom_args = custom_args;
        }

        self.store.put(&record).await?;
        if record.name != old_name
            && let Err(e) =
                tokio::fs::rename(self.log_path(&old_name), self.log_path(&record.name)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to move log for VM {}: {}", id, e);
        }
        info!(vm = %record.name, %id, "VM record updated");
        Ok(reconcile(record))
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: Uuid) -> Result<ActionOutcome> {
        let _guard = self.lock_vm(id).await;
        let mut record = self.store.get(id).await?;

        if Self::live_pid(&record).is_some() {
            let view = reconcile(record);
            return Ok(ActionOutcome {
                id,
                status: view.status,
                note: Some("already running".into()),
            });
        }

        record.clear_process();
        self.launch(&mut record).await?;
        self.store.put(&record).await?;
        info!(vm = %record.name, pid = ?record.pid, "VM started");
        Ok(ActionOutcome {
            id,
            status: VmStatus::Running,
            note: None,
        })
    }

    /// Ensure the VM is not running. A dead process is not an error.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: Uuid) -> Result<ActionOutcome> {
        let _guard = self.lock_vm(id).await;
        let mut record = self.store.get(id).await?;

        let note = match Self::live_pid(&record) {
            Some(pid) => match Self::terminate(pid) {
                Ok(()) => None,
                Err(e) => {
                    debug!("SIGTERM to {} failed: {}", pid, e);
                    Some(ALREADY_STOPPED.to_string())
                }
            },
            None => Some(ALREADY_STOPPED.to_string()),
        };

        record.clear_process();
        self.store.put(&record).await?;
        info!(vm = %record.name, note = ?note, "VM stopped");
        Ok(ActionOutcome {
            id,
            status: VmStatus::Stopped,
            note,
        })
    }

    /// Suspend the host process (SIGSTOP). Not a hypervisor-level pause.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: Uuid) -> Result<ActionOutcome> {
        self.suspend_or_continue(id, Signal::SIGSTOP, VmStatus::Paused)
            .await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, id: Uuid) -> Result<ActionOutcome> {
        self.suspend_or_continue(id, Signal::SIGCONT, VmStatus::Running)
            .await
    }

    async fn suspend_or_continue(
        &self,
        id: Uuid,
        signal: Signal,
        target: VmStatus,
    ) -> Result<ActionOutcome> {
        let _guard = self.lock_vm(id).await;
        let mut record = self.store.get(id).await?;

        let delivered = match Self::live_pid(&record) {
            Some(pid) => match process::signal(pid, signal) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{} to VM {} failed: {}", signal.as_str(), id, e);
                    false
                }
            },
            None => false,
        };

        let (status, note) = if delivered {
            record.status = target;
            (target, None)
        } else {
            record.clear_process();
            (VmStatus::Stopped, Some(NOT_RUNNING.to_string()))
        };

        self.store.put(&record).await?;
        info!(vm = %record.name, %status, "VM signalled with {}", signal.as_str());
        Ok(ActionOutcome { id, status, note })
    }

    /// Stop (waiting for the old process to go away) and launch again with the
    /// persisted parameters.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: Uuid) -> Result<ActionOutcome> {
        let _guard = self.lock_vm(id).await;
        let mut record = self.store.get(id).await?;

        let note = match Self::live_pid(&record) {
            Some(pid) => {
                self.terminate_and_wait(pid, record.process_start_time)
                    .await;
                None
            }
            None => Some(ALREADY_STOPPED.to_string()),
        };

        record.clear_process();
        if let Err(e) = self.launch(&mut record).await {
            self.store.put(&record).await?;
            return Err(e);
        }
        self.store.put(&record).await?;
        info!(vm = %record.name, pid = ?record.pid, "VM restarted");
        Ok(ActionOutcome {
            id,
            status: VmStatus::Running,
            note,
        })
    }

    /// Kill (best effort), drop the record and optionally the backing disk.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid, remove_disks: bool) -> Result<DeleteOutcome> {
        let _guard = self.lock_vm(id).await;
        let record = self.store.get(id).await?;

        let killed = match Self::live_pid(&record) {
            Some(pid) => Self::terminate(pid)
                .map_err(|e| warn!("Failed to signal VM {} (pid {}): {}", id, pid, e))
                .is_ok(),
            None => false,
        };

        self.store.delete(id).await?;

        let mut disk_removed = false;
        if remove_disks {
            let filename = record
                .disk_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            let in_disk_dir = record.disk_path.parent() == Some(self.disks.disk_dir());
            match filename {
                Some(filename) if in_disk_dir => match self.disks.delete(&filename).await {
                    Ok(()) => disk_removed = true,
                    Err(e) => warn!("Failed to remove disk of VM {}: {}", id, e),
                },
                _ => warn!(
                    "Not removing {}: outside the disk directory",
                    record.disk_path.display()
                ),
            }
        }

        if let Err(e) = tokio::fs::remove_file(self.log_path(&record.name)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!("Failed to remove log for VM {}: {}", id, e);
        }

        info!(vm = %record.name, killed, disk_removed, "VM deleted");
        Ok(DeleteOutcome {
            id,
            killed,
            disk_removed,
        })
    }

    /// Last part of the hypervisor's stdout/stderr.
    pub async fn log_tail(&self, id: Uuid) -> Result<String> {
        let record = self.store.get(id).await?;
        Ok(read_tail(&self.log_path(&record.name), LOG_TAIL_BYTES)
            .await
            .unwrap_or_default())
    }

    fn live_pid(record: &VmRecord) -> Option<u32> {
        record
            .pid
            .filter(|pid| process::is_alive(*pid, record.process_start_time))
    }

    fn terminate(pid: u32) -> std::result::Result<(), nix::errno::Errno> {
        process::signal(pid, Signal::SIGTERM)?;
        // A SIGSTOPped process only acts on SIGTERM once continued.
        let _ = process::signal(pid, Signal::SIGCONT);
        Ok(())
    }

    async fn wait_for_exit(pid: u32, start_time: Option<u64>, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while process::is_alive(pid, start_time) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        true
    }

    async fn terminate_and_wait(&self, pid: u32, start_time: Option<u64>) {
        if let Err(e) = Self::terminate(pid) {
            debug!("SIGTERM to {} failed: {}", pid, e);
            return;
        }
        if Self::wait_for_exit(pid, start_time, self.settings.stop_timeout).await {
            return;
        }
        warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
        let _ = process::signal(pid, Signal::SIGKILL);
        Self::wait_for_exit(pid, start_time, Duration::from_secs(2)).await;
    }

    /// Spawn QEMU for `record` and fill in its process fields.
    async fn launch(&self, record: &mut VmRecord) -> Result<()> {
        if !tokio::fs::try_exists(&record.disk_path).await? {
            return Err(NodeError::not_found(format!(
                "disk {}",
                record.disk_path.display()
            )));
        }
        let iso_path = match &record.iso {
            Some(iso) => Some(self.isos.existing(iso).await?),
            None => None,
        };
        let args = build_args(record, iso_path.as_deref(), &self.settings)?;
        let log_path = self.log_path(&record.name);

        debug!("Spawning {} {}", self.settings.binary.display(), args.join(" "));
        let mut child = process::spawn_detached(&self.settings.binary, &args, &log_path)
            .map_err(|e| {
                NodeError::ExternalTool(format!(
                    "failed to start {}: {e}",
                    self.settings.binary.display()
                ))
            })?;
        let pid = child.id().ok_or_else(|| {
            NodeError::ExternalTool("hypervisor exited before its pid was known".into())
        })?;
        let start_time = process::start_time(pid);

        // The caller's VM lock stays held through the grace period.
        tokio::time::sleep(self.settings.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            let tail = read_tail(&log_path, 2048).await.unwrap_or_default();
            return Err(NodeError::ExternalTool(format!(
                "hypervisor exited during startup ({status}): {}",
                tail.trim()
            )));
        }

        info!(vm = %record.name, pid, "Hypervisor process started");
        tokio::spawn(reap(child, record.name.clone()));

        record.pid = Some(pid);
        record.process_start_time = start_time;
        record.status = VmStatus::Running;
        record.started_at = Some(Utc::now());
        Ok(())
    }
}

/// Collect the exit status so the process does not linger as a zombie.
async fn reap(mut child: Child, name: String) {
    match child.wait().await {
        Ok(status) => info!(vm = %name, %status, "Hypervisor process exited"),
        Err(e) => warn!(vm = %name, "Failed to wait for hypervisor process: {}", e),
    }
}

async fn read_tail(path: &Path, max: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    file.seek(std::io::SeekFrom::Start(len.saturating_sub(max)))
        .await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
