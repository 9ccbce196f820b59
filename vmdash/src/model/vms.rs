use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;
use vmdash_node::model::{
    self as node, ActionOutcome, DeleteOutcome, Network, NetworkMode, Snapshot, VmPatch, VmSpec,
    VmView,
};
use vmdash_node::qemu::args::split_legacy;

#[derive(Serialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    pub id: Uuid,
    pub name: String,
    pub status: VmStatus,
    pub uptime: Option<String>,
    pub cpus: u32,
    #[schema(example = "2 GB")]
    pub memory: String,
    pub disk_name: String,
    pub disk_path: String,
    pub disk_format: String,
    pub iso: Option<String>,
    pub os: Option<String>,
    pub network_type: NetworkType,
    pub network_bridge: Option<String>,
    #[serde(rename = "enableKVM")]
    pub enable_kvm: bool,
    #[serde(rename = "enableEFI")]
    pub enable_efi: bool,
    pub custom_args: Vec<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<VmView> for Vm {
    fn from(view: VmView) -> Self {
        let record = view.record;
        // The pid of a dead process means nothing to callers.
        let pid = record.pid.filter(|_| view.status != node::VmStatus::Stopped);
        Vm {
            id: record.id,
            name: record.name,
            status: view.status.into(),
            uptime: view.uptime,
            cpus: record.cpus,
            memory: record.memory,
            disk_name: record.disk_name,
            disk_path: record.disk_path.display().to_string(),
            disk_format: record.disk_format.to_string(),
            iso: record.iso,
            os: record.os,
            network_type: record.network.mode.into(),
            network_bridge: record.network.bridge,
            enable_kvm: record.enable_kvm,
            enable_efi: record.enable_efi,
            custom_args: record.custom_args,
            pid,
            started_at: record.started_at,
            created_at: record.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, ToSchema, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VmStatus {
    Running,
    Paused,
    Stopped,
}

impl From<node::VmStatus> for VmStatus {
    fn from(status: node::VmStatus) -> Self {
        match status {
            node::VmStatus::Running => VmStatus::Running,
            node::VmStatus::Paused => VmStatus::Paused,
            node::VmStatus::Stopped => VmStatus::Stopped,
        }
    }
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Default, Eq, PartialEq, ToSchema, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkType {
    User,
    Bridge,
    #[default]
    None,
}

impl From<NetworkMode> for NetworkType {
    fn from(mode: NetworkMode) -> Self {
        match mode {
            NetworkMode::User => NetworkType::User,
            NetworkMode::Bridge => NetworkType::Bridge,
            NetworkMode::None => NetworkType::None,
        }
    }
}

impl From<NetworkType> for NetworkMode {
    fn from(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::User => NetworkMode::User,
            NetworkType::Bridge => NetworkMode::Bridge,
            NetworkType::None => NetworkMode::None,
        }
    }
}

/// Memory as a number of gigabytes or a string such as `"512 MB"`.
#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
#[serde(untagged)]
pub enum Memory {
    Gigabytes(u64),
    Text(String),
}

impl From<Memory> for String {
    fn from(memory: Memory) -> Self {
        match memory {
            Memory::Gigabytes(gb) => gb.to_string(),
            Memory::Text(text) => text,
        }
    }
}

/// Extra hypervisor arguments, one token per element. A plain string is
/// split on whitespace.
#[derive(Deserialize, Debug, Clone, ToSchema)]
#[serde(untagged)]
pub enum CustomArgs {
    List(Vec<String>),
    Legacy(String),
}

impl From<CustomArgs> for Vec<String> {
    fn from(args: CustomArgs) -> Self {
        match args {
            CustomArgs::List(args) => args,
            CustomArgs::Legacy(line) => split_legacy(&line),
        }
    }
}

#[derive(Deserialize, Debug, Clone, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewVm {
    #[serde(default)]
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[serde(default)]
    #[validate(range(min = 1, message = "cpus must be at least 1"))]
    pub cpus: u32,
    #[validate(required(message = "memory is required"))]
    pub memory: Option<Memory>,
    #[serde(default)]
    #[validate(length(min = 1, message = "diskName is required"))]
    pub disk_name: String,
    /// Size in GB of a dynamic qcow2 disk created when `diskName` does not exist.
    #[validate(range(min = 1))]
    pub disk_size: Option<u64>,
    pub os: Option<String>,
    pub iso: Option<String>,
    #[serde(default)]
    pub network_type: NetworkType,
    pub network_bridge: Option<String>,
    #[serde(default, rename = "enableKVM")]
    pub enable_kvm: bool,
    #[serde(default, rename = "enableEFI")]
    pub enable_efi: bool,
    pub custom_args: Option<CustomArgs>,
}

impl From<NewVm> for VmSpec {
    fn from(vm: NewVm) -> Self {
        VmSpec {
            name: vm.name,
            cpus: vm.cpus,
            memory: vm.memory.map(String::from).unwrap_or_default(),
            disk_name: vm.disk_name,
            disk_size_gb: vm.disk_size,
            os: vm.os,
            iso: vm.iso.filter(|iso| !iso.is_empty()),
            network: Network {
                mode: vm.network_type.into(),
                bridge: vm.network_bridge.filter(|b| !b.is_empty()),
            },
            enable_kvm: vm.enable_kvm,
            enable_efi: vm.enable_efi,
            custom_args: vm.custom_args.map(Vec::from).unwrap_or_default(),
        }
    }
}

/// Fields to merge into a VM record. Applied on the next start.
#[derive(Deserialize, Debug, Clone, Default, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVm {
    #[validate(length(min = 1))]
    pub name: Option<String>,
    #[validate(range(min = 1))]
    pub cpus: Option<u32>,
    pub memory: Option<Memory>,
    pub os: Option<String>,
    /// `null` detaches the current ISO.
    #[serde(default, with = "::serde_with::rust::double_option")]
    #[schema(value_type = Option<String>)]
    pub iso: Option<Option<String>>,
    pub network_type: Option<NetworkType>,
    pub network_bridge: Option<String>,
    #[serde(rename = "enableKVM")]
    pub enable_kvm: Option<bool>,
    #[serde(rename = "enableEFI")]
    pub enable_efi: Option<bool>,
    pub custom_args: Option<CustomArgs>,
}

impl From<UpdateVm> for VmPatch {
    fn from(update: UpdateVm) -> Self {
        // A bridge name on its own implies bridged networking.
        let mode = match (update.network_type, &update.network_bridge) {
            (Some(network_type), _) => Some(network_type.into()),
            (None, Some(_)) => Some(NetworkMode::Bridge),
            (None, None) => None,
        };
        VmPatch {
            name: update.name,
            cpus: update.cpus,
            memory: update.memory.map(String::from),
            os: update.os,
            iso: update.iso.map(|iso| iso.filter(|i| !i.is_empty())),
            network: mode.map(|mode| Network {
                mode,
                bridge: update.network_bridge,
            }),
            enable_kvm: update.enable_kvm,
            enable_efi: update.enable_efi,
            custom_args: update.custom_args.map(Vec::from),
        }
    }
}

#[derive(Deserialize, Debug, Default, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct DeleteVmParams {
    /// Also delete the VM's disk image.
    #[serde(default)]
    pub remove_disks: bool,
}

#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct VmAction {
    pub id: Uuid,
    pub status: VmStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl From<ActionOutcome> for VmAction {
    fn from(outcome: ActionOutcome) -> Self {
        VmAction {
            id: outcome.id,
            status: outcome.status.into(),
            note: outcome.note,
        }
    }
}

#[derive(Serialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeletedVm {
    pub id: Uuid,
    pub killed: bool,
    pub disk_removed: bool,
}

impl From<DeleteOutcome> for DeletedVm {
    fn from(outcome: DeleteOutcome) -> Self {
        DeletedVm {
            id: outcome.id,
            killed: outcome.killed,
            disk_removed: outcome.disk_removed,
        }
    }
}

#[derive(Serialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmSnapshot {
    pub vm_id: Uuid,
    pub filename: String,
    pub path: String,
    pub backing_file: String,
    pub created_at: DateTime<Utc>,
}

impl From<Snapshot> for VmSnapshot {
    fn from(snapshot: Snapshot) -> Self {
        VmSnapshot {
            vm_id: snapshot.vm_id,
            filename: snapshot.filename,
            path: snapshot.path.display().to_string(),
            backing_file: snapshot.backing_file.display().to_string(),
            created_at: snapshot.created_at,
        }
    }
}

#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct VmLog {
    pub id: Uuid,
    pub log: String,
}
