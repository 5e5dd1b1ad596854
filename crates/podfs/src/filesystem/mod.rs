//! Filesystem operations for pods.
//!
//! This module handles:
//! - Replicating an image tree into a pod rootfs with shifted ownership
//! - Platform operations for devices, fifos, ownership and timestamps
//! - Measuring tree size

mod platform;
mod replicate;
mod size;

pub use platform::{
    Capabilities, DeviceKind, EntryTimes, FileTime, HostPlatform, Platform, device_numbers,
};
pub use replicate::{CopyStats, EntryKind, TreeReplicator, copy_tree};
pub use size::dir_size;
