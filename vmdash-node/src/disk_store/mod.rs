//! Disk image management

mod manager;

pub use manager::{DiskManager, DiskUpdate, RESOLVE_ORDER};
