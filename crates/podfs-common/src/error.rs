//! Common error types for podfs.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

use crate::uid::ShiftError;

/// Result type alias using [`PodfsError`].
pub type PodfsResult<T> = Result<T, PodfsError>;

/// Errors produced by the locking and tree replication subsystem.
#[derive(Error, Diagnostic, Debug)]
pub enum PodfsError {
    /// A non-blocking lock attempt found a conflicting holder.
    #[error("File already locked: {}", path.display())]
    #[diagnostic(
        code(podfs::lock::locked),
        help("Another process holds a conflicting lock; retry later or use the blocking form")
    )]
    Locked {
        /// Path of the contended lock target.
        path: PathBuf,
    },

    /// The lock target does not exist.
    #[error("Lock target does not exist: {}", path.display())]
    #[diagnostic(code(podfs::lock::not_exist))]
    LockTargetMissing {
        /// Path that could not be opened.
        path: PathBuf,
    },

    /// The lock target could not be opened for lack of permission.
    #[error("Permission denied opening lock target: {}", path.display())]
    #[diagnostic(code(podfs::lock::permission))]
    LockTargetPermission {
        /// Path that could not be opened.
        path: PathBuf,
    },

    /// The lock target is not of the requested kind.
    #[error("Lock target {} is not a {expected}", path.display())]
    #[diagnostic(code(podfs::lock::wrong_type))]
    LockTargetWrongType {
        /// Path of the lock target.
        path: PathBuf,
        /// The kind that was requested.
        expected: &'static str,
    },

    /// An operation was attempted on a closed lock handle.
    #[error("Lock on {} is closed", path.display())]
    #[diagnostic(code(podfs::lock::closed))]
    LockClosed {
        /// Path the handle was opened on.
        path: PathBuf,
    },

    /// A key lock name is not a single path component.
    #[error("Invalid lock key: {key:?}")]
    #[diagnostic(
        code(podfs::lock::invalid_key),
        help("Keys must be non-empty and must not contain '/' or be '.' or '..'")
    )]
    InvalidLockKey {
        /// The rejected key.
        key: String,
    },

    /// The operating system rejected a lock call.
    #[error("Lock operation on {} failed: {source}", path.display())]
    #[diagnostic(code(podfs::lock::os))]
    Lock {
        /// Path of the lock target.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Traversal or entry creation failed during a tree copy.
    #[error("Failed to replicate {}: {source}", path.display())]
    #[diagnostic(code(podfs::tree::walk))]
    TreeWalk {
        /// Offending path, relative to the source root.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be read while measuring a tree.
    #[error("Failed to measure {}: {source}", path.display())]
    #[diagnostic(code(podfs::size::walk))]
    SizeWalk {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A source entry has a file type with no destination representation.
    #[error("Unsupported file type at {}: mode {mode:o}", path.display())]
    #[diagnostic(
        code(podfs::tree::unsupported_type),
        help("Only directories, regular files, symlinks, devices and fifos can be replicated")
    )]
    UnsupportedEntryType {
        /// Offending path, relative to the source root.
        path: PathBuf,
        /// Raw `st_mode` of the entry.
        mode: u32,
    },

    /// A platform capability needed for an entry is unavailable.
    #[error("Feature not supported: {feature} (needed for {})", path.display())]
    #[diagnostic(
        code(podfs::unsupported),
        help("Device nodes and ownership changes usually require running as root")
    )]
    Unsupported {
        /// The missing capability.
        feature: &'static str,
        /// Offending path, relative to the source root.
        path: PathBuf,
    },

    /// The UID range refused to map an entry's ownership.
    #[error("Failed to shift ownership of {}: {source}", path.display())]
    #[diagnostic(code(podfs::tree::ownership_shift))]
    OwnershipShift {
        /// Offending path, relative to the source root.
        path: PathBuf,
        /// Error returned by the range.
        #[source]
        source: ShiftError,
    },

    /// A UID range string could not be parsed.
    #[error("Invalid UID range: {value}")]
    #[diagnostic(
        code(podfs::uid::invalid_range),
        help("Use the form '<shift>:<count>', for example '100000:65536'")
    )]
    InvalidUidRange {
        /// The rejected value.
        value: String,
    },

    /// Invalid pod ID format.
    #[error("Invalid pod ID: {id}")]
    #[diagnostic(
        code(podfs::pod::invalid_id),
        help("Pod IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidPodId {
        /// The invalid pod ID.
        id: String,
    },

    /// Invalid image ID format.
    #[error("Invalid image ID: {id}")]
    #[diagnostic(
        code(podfs::image::invalid_id),
        help("Image IDs look like 'sha512-<hex>'")
    )]
    InvalidImageId {
        /// The invalid image ID.
        id: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(podfs::io))]
    Io(#[from] std::io::Error),
}

impl PodfsError {
    /// Builds a [`PodfsError::TreeWalk`] for `path`.
    pub fn tree_walk(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::TreeWalk {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Builds a [`PodfsError::SizeWalk`] for `path`.
    pub fn size_walk(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::SizeWalk {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this is lock contention from a `try_*` call.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// Whether the error reports a missing file or lock target.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::LockTargetMissing { .. } => true,
            Self::TreeWalk { source, .. }
            | Self::SizeWalk { source, .. }
            | Self::Lock { source, .. }
            | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }

    /// The path the error is attributed to, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Locked { path }
            | Self::LockTargetMissing { path }
            | Self::LockTargetPermission { path }
            | Self::LockTargetWrongType { path, .. }
            | Self::LockClosed { path }
            | Self::Lock { path, .. }
            | Self::TreeWalk { path, .. }
            | Self::SizeWalk { path, .. }
            | Self::UnsupportedEntryType { path, .. }
            | Self::Unsupported { path, .. }
            | Self::OwnershipShift { path, .. } => Some(path),
            _ => None,
        }
    }
}
