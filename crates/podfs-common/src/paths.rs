//! Standard filesystem paths for podfs.

use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::id::{ImageId, PodId};

/// Default root directory for podfs data.
pub static PODFS_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PODFS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/podfs"))
});

/// Standard paths used by podfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodPaths {
    /// Root data directory (default: /var/lib/podfs).
    pub root: PathBuf,
}

impl PodPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one subdirectory per pod.
    #[must_use]
    pub fn pods(&self) -> PathBuf {
        self.root.join("pods")
    }

    /// Directory for a specific pod. This is also the pod's lock target.
    #[must_use]
    pub fn pod(&self, id: &PodId) -> PathBuf {
        self.pods().join(id.as_str())
    }

    /// Replicated root filesystem of a pod.
    #[must_use]
    pub fn pod_rootfs(&self, id: &PodId) -> PathBuf {
        self.pod(id).join("rootfs")
    }

    /// Store of extracted image trees.
    #[must_use]
    pub fn trees(&self) -> PathBuf {
        self.root.join("trees")
    }

    /// Extracted tree of an image, sharded by hash prefix.
    ///
    /// `sha512-abcd...` lives at `trees/sha512/ab/sha512-abcd...`.
    #[must_use]
    pub fn image_tree(&self, id: &ImageId) -> PathBuf {
        let [algorithm, prefix] = id.block_prefix();
        self.trees()
            .join(algorithm)
            .join(prefix)
            .join(id.to_string())
    }

    /// Directory of per-key lock files.
    #[must_use]
    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.pods())?;
        std::fs::create_dir_all(self.trees())?;
        std::fs::create_dir_all(self.locks())?;
        tracing::debug!(root = %self.root.display(), "podfs layout ready");
        Ok(())
    }
}

impl Default for PodPaths {
    fn default() -> Self {
        Self {
            root: PODFS_ROOT.clone(),
        }
    }
}
