//! QEMU process supervision
//!
//! VMs are plain `qemu-system-*` processes spawned detached from vmdash and
//! addressed afterwards only through their recorded pid.

pub mod args;
mod manager;

use std::path::PathBuf;
use std::time::Duration;

pub use manager::VmSupervisor;

#[derive(Debug, Clone)]
pub struct QemuSettings {
    pub binary: PathBuf,
    /// UEFI firmware passed with `-bios` when EFI boot is requested.
    pub firmware: PathBuf,
    pub display: Option<String>,
    /// How long a fresh process must survive before the launch counts.
    pub startup_grace: Duration,
    /// How long restart waits for the old process before SIGKILL.
    pub stop_timeout: Duration,
}

impl Default for QemuSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("qemu-system-x86_64"),
            firmware: PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd"),
            display: Some("none".into()),
            startup_grace: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
        }
    }
}
