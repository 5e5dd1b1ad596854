//! # podfs
//!
//! Pod filesystem preparation: advisory locking and ownership-shifting tree
//! replication.
//!
//! ## Features
//!
//! - **Advisory locks**: shared and exclusive `flock(2)` locks on pod
//!   directories and per-key lock files, with promotion and demotion
//! - **Tree replication**: copies an image tree into a pod rootfs, shifting
//!   UID/GID into the pod's range and reproducing devices, fifos, symlinks,
//!   permissions and timestamps
//! - **Size accounting**: logical size of a tree with hard links counted once
//!
//! ## Usage
//!
//! ```no_run
//! use podfs::filesystem::TreeReplicator;
//! use podfs::lock::{LockHandle, LockKind};
//! use podfs_common::UidRange;
//! use std::path::Path;
//!
//! # fn example() -> podfs_common::PodfsResult<()> {
//! let pod_dir = Path::new("/var/lib/podfs/pods/pod-1");
//! let mut lock = LockHandle::exclusive_at(pod_dir, LockKind::Directory)?;
//!
//! let platform = podfs::PodfsConfig::default().platform();
//! let stats = TreeReplicator::new(&platform).copy_tree(
//!     Path::new("/var/lib/podfs/trees/sha512/ab/sha512-ab12"),
//!     &pod_dir.join("rootfs"),
//!     &UidRange::new(100_000, 65_536),
//! )?;
//! lock.unlock()?;
//! println!("copied {} entries", stats.entries());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod filesystem;
pub mod lock;
pub mod pod;

pub use config::PodfsConfig;
pub use pod::{LockWait, PreparedPod, prepare_pod};
