pub mod disks;
pub mod isos;
pub mod vms;
