pub mod disk_store;
pub mod error;
pub mod image_tool;
pub mod iso_store;
pub mod layout;
pub mod locks;
pub mod model;
pub mod process;
pub mod qemu;
pub mod snapshot;
pub mod state;

pub use error::{NodeError, Result};
