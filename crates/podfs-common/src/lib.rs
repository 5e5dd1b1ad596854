//! # podfs-common
//!
//! Shared types for the pod filesystem subsystem.
//!
//! This crate provides:
//! - The error taxonomy shared by locking and tree replication
//! - UID/GID range shifting for user-namespace isolated pods
//! - Pod and image identifiers
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;
pub mod uid;

pub use error::{PodfsError, PodfsResult};
pub use id::{ImageId, PodId};
pub use paths::PodPaths;
pub use uid::{ShiftError, ShiftRange, UidRange};
