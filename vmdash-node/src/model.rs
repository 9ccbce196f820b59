use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq, Hash, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
    Vpc,
}

impl DiskFormat {
    pub const ALL: [DiskFormat; 5] = [
        DiskFormat::Qcow2,
        DiskFormat::Raw,
        DiskFormat::Vmdk,
        DiskFormat::Vdi,
        DiskFormat::Vpc,
    ];

    /// File extension used for newly created images.
    pub fn extension(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Vpc => "vhd",
        }
    }

    /// Allocation types the format can be created with.
    pub fn supports(self, allocation: Allocation) -> bool {
        match self {
            DiskFormat::Raw => allocation == Allocation::Fixed,
            DiskFormat::Vdi | DiskFormat::Vpc => allocation == Allocation::Dynamic,
            DiskFormat::Qcow2 | DiskFormat::Vmdk => true,
        }
    }

    pub fn resizable(self) -> bool {
        matches!(self, DiskFormat::Qcow2 | DiskFormat::Raw | DiskFormat::Vmdk)
    }
}

#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, Default, Eq, PartialEq, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Allocation {
    #[default]
    Dynamic,
    Fixed,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VmStatus {
    Running,
    Paused,
    Stopped,
}

#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, Default, Eq, PartialEq, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkMode {
    User,
    Bridge,
    #[default]
    None,
}

pub const DEFAULT_BRIDGE: &str = "br0";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Network {
    pub mode: NetworkMode,
    /// Only meaningful in bridge mode; falls back to `br0`.
    pub bridge: Option<String>,
}

impl Network {
    pub fn bridge_name(&self) -> &str {
        self.bridge.as_deref().unwrap_or(DEFAULT_BRIDGE)
    }
}

/// Persisted VM record, one file per VM keyed by name.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VmRecord {
    pub id: Uuid,
    pub name: String,
    pub cpus: u32,
    /// Human readable, e.g. "2 GB".
    pub memory: String,
    pub disk_name: String,
    pub disk_path: PathBuf,
    pub disk_format: DiskFormat,
    pub iso: Option<String>,
    pub os: Option<String>,
    pub network: Network,
    pub enable_kvm: bool,
    pub enable_efi: bool,
    #[serde(default)]
    pub custom_args: Vec<String>,

    pub pid: Option<u32>,
    /// Kernel start time of `pid` in clock ticks, used to detect pid reuse.
    pub process_start_time: Option<u64>,
    /// Last status written by a lifecycle operation. Not authoritative.
    pub status: VmStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn clear_process(&mut self) {
        self.pid = None;
        self.process_start_time = None;
        self.started_at = None;
        self.status = VmStatus::Stopped;
    }
}

/// A record with its status recomputed against the process table.
#[derive(Serialize, Debug, Clone)]
pub struct VmView {
    pub record: VmRecord,
    pub status: VmStatus,
    pub uptime: Option<String>,
}

/// Everything needed to create a VM.
#[derive(Debug, Clone, Default)]
pub struct VmSpec {
    pub name: String,
    pub cpus: u32,
    pub memory: String,
    pub disk_name: String,
    /// When set and the disk does not exist, a dynamic qcow2 disk of this size is created.
    pub disk_size_gb: Option<u64>,
    pub os: Option<String>,
    pub iso: Option<String>,
    pub network: Network,
    pub enable_kvm: bool,
    pub enable_efi: bool,
    pub custom_args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VmPatch {
    pub name: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub os: Option<String>,
    /// `Some(None)` detaches the ISO.
    pub iso: Option<Option<String>>,
    pub network: Option<Network>,
    pub enable_kvm: Option<bool>,
    pub enable_efi: Option<bool>,
    pub custom_args: Option<Vec<String>>,
}

/// Outcome of a lifecycle operation.
#[derive(Serialize, Debug, Clone)]
pub struct ActionOutcome {
    pub id: Uuid,
    pub status: VmStatus,
    pub note: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct DeleteOutcome {
    pub id: Uuid,
    /// Whether a live process was actually signalled.
    pub killed: bool,
    pub disk_removed: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct Disk {
    pub name: String,
    pub filename: String,
    pub format: DiskFormat,
    /// Virtual size in GB, rounded down.
    pub size: u64,
    pub virtual_size_bytes: u64,
    pub actual_size_bytes: Option<u64>,
    #[serde(rename = "type")]
    pub allocation: Allocation,
}

#[derive(Serialize, Debug, Clone)]
pub struct Iso {
    pub name: String,
    pub size_bytes: u64,
    pub size: String,
    pub modified: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Snapshot {
    pub vm_id: Uuid,
    pub filename: String,
    pub path: PathBuf,
    pub backing_file: PathBuf,
    pub created_at: DateTime<Utc>,
}

const MIB_PER_GIB: u64 = 1024;

/// Parse a memory amount into MiB. Bare numbers are GB; `M`/`MB`/`G`/`GB`
/// suffixes are accepted with optional whitespace.
pub fn parse_memory(input: &str) -> Option<u64> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let mib = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "G" | "GB" | "GIB" => value.checked_mul(MIB_PER_GIB)?,
        "M" | "MB" | "MIB" => value,
        _ => return None,
    };
    (mib > 0).then_some(mib)
}

/// Display form stored on the record.
pub fn format_memory(mib: u64) -> String {
    if mib % MIB_PER_GIB == 0 {
        format!("{} GB", mib / MIB_PER_GIB)
    } else {
        format!("{mib} MB")
    }
}

/// Value for the hypervisor's `-m` option.
pub fn memory_arg(mib: u64) -> String {
    if mib % MIB_PER_GIB == 0 {
        format!("{}G", mib / MIB_PER_GIB)
    } else {
        format!("{mib}M")
    }
}

/// File names coming from requests must not escape their directory.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
