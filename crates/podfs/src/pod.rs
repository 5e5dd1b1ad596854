//! Pod root filesystem preparation.

use std::path::{Path, PathBuf};

use podfs_common::{PodId, PodfsError, PodfsResult};

use crate::config::PodfsConfig;
use crate::filesystem::{CopyStats, TreeReplicator};
use crate::lock::{LockHandle, LockKind};

/// What to do when another process holds the pod lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    /// Fail with `PodfsError::Locked`.
    #[default]
    Fail,
    /// Block until the lock is released.
    Block,
}

/// Result of [`prepare_pod`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPod {
    /// The prepared pod.
    pub id: PodId,
    /// The replicated root filesystem.
    pub rootfs: PathBuf,
    /// What the copy produced.
    pub stats: CopyStats,
}

/// Replicates `image_tree` into the pod's rootfs while holding the pod
/// directory's exclusive lock.
///
/// The store layout under the configured root is created first. The lock is
/// released whether or not the copy succeeds.
///
/// # Errors
///
/// Returns [`PodfsError::Locked`] when `wait` is [`LockWait::Fail`] and the
/// pod is locked, or any error of the tree copy.
pub fn prepare_pod(
    config: &PodfsConfig,
    pod: &PodId,
    image_tree: &Path,
    wait: LockWait,
) -> PodfsResult<PreparedPod> {
    config
        .paths
        .create_dirs()
        .map_err(|source| PodfsError::Lock {
            path: config.paths.root.clone(),
            source,
        })?;
    let pod_dir = config.paths.pod(pod);
    std::fs::create_dir_all(&pod_dir).map_err(|source| PodfsError::Lock {
        path: pod_dir.clone(),
        source,
    })?;

    let mut lock = LockHandle::open(&pod_dir, LockKind::Directory)?;
    match wait {
        LockWait::Fail => lock.try_exclusive()?,
        LockWait::Block => lock.exclusive()?,
    }

    tracing::info!(
        pod = %pod,
        image = %image_tree.display(),
        uid_range = %config.uid_range,
        "preparing pod rootfs"
    );

    let platform = config.platform();
    let rootfs = config.paths.pod_rootfs(pod);
    let copied = TreeReplicator::new(&platform).copy_tree(image_tree, &rootfs, &config.uid_range);
    let released = lock.close();

    let stats = copied?;
    released?;

    tracing::info!(pod = %pod, entries = stats.entries(), bytes = stats.bytes, "pod rootfs ready");
    Ok(PreparedPod {
        id: pod.clone(),
        rootfs,
        stats,
    })
}
