use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;
use validator::Validate;
use vmdash_node::disk_store::DiskUpdate;
use vmdash_node::model::{self as node, Allocation};

#[derive(Serialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    pub filename: String,
    pub format: DiskFormat,
    /// Virtual size in GB.
    pub size: u64,
    pub virtual_size_bytes: u64,
    pub actual_size_bytes: Option<u64>,
    #[serde(rename = "type")]
    pub disk_type: DiskType,
}

impl From<node::Disk> for Disk {
    fn from(disk: node::Disk) -> Self {
        Disk {
            name: disk.name,
            filename: disk.filename,
            format: disk.format.into(),
            size: disk.size,
            virtual_size_bytes: disk.virtual_size_bytes,
            actual_size_bytes: disk.actual_size_bytes,
            disk_type: disk.allocation.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, ToSchema, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
    Vpc,
}

impl From<node::DiskFormat> for DiskFormat {
    fn from(format: node::DiskFormat) -> Self {
        match format {
            node::DiskFormat::Qcow2 => DiskFormat::Qcow2,
            node::DiskFormat::Raw => DiskFormat::Raw,
            node::DiskFormat::Vmdk => DiskFormat::Vmdk,
            node::DiskFormat::Vdi => DiskFormat::Vdi,
            node::DiskFormat::Vpc => DiskFormat::Vpc,
        }
    }
}

impl From<DiskFormat> for node::DiskFormat {
    fn from(format: DiskFormat) -> Self {
        match format {
            DiskFormat::Qcow2 => node::DiskFormat::Qcow2,
            DiskFormat::Raw => node::DiskFormat::Raw,
            DiskFormat::Vmdk => node::DiskFormat::Vmdk,
            DiskFormat::Vdi => node::DiskFormat::Vdi,
            DiskFormat::Vpc => node::DiskFormat::Vpc,
        }
    }
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Default, Eq, PartialEq, ToSchema, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskType {
    #[default]
    Dynamic,
    Fixed,
}

impl From<Allocation> for DiskType {
    fn from(allocation: Allocation) -> Self {
        match allocation {
            Allocation::Dynamic => DiskType::Dynamic,
            Allocation::Fixed => DiskType::Fixed,
        }
    }
}

impl From<DiskType> for Allocation {
    fn from(disk_type: DiskType) -> Self {
        match disk_type {
            DiskType::Dynamic => Allocation::Dynamic,
            DiskType::Fixed => Allocation::Fixed,
        }
    }
}

#[derive(Deserialize, Debug, Clone, ToSchema, Validate)]
pub struct NewDisk {
    #[serde(default)]
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    /// Virtual size in GB.
    #[serde(default)]
    #[validate(range(min = 1, message = "size must be at least 1 GB"))]
    pub size: u64,
    pub format: DiskFormat,
    #[serde(default, rename = "type")]
    pub disk_type: DiskType,
}

#[derive(Deserialize, Debug, Clone, Default, ToSchema, Validate)]
pub struct UpdateDisk {
    /// New file stem; the extension is kept.
    #[validate(length(min = 1))]
    pub name: Option<String>,
    /// New virtual size in GB. Must grow the disk.
    #[validate(range(min = 1))]
    pub size: Option<u64>,
}

impl From<UpdateDisk> for DiskUpdate {
    fn from(update: UpdateDisk) -> Self {
        DiskUpdate {
            name: update.name,
            size_gb: update.size,
        }
    }
}
