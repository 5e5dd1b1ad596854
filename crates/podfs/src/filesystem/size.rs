//! Disk usage of a tree.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use podfs_common::{PodfsError, PodfsResult};
use walkdir::WalkDir;

/// Total logical size in bytes of `path` and everything below it.
///
/// Every entry, directories and symlinks included, contributes its `lstat`
/// size. A file with several hard links in the tree is counted once.
/// Symlinks are not followed, not even at `path` itself, so a symlink root
/// counts as the link alone. A path that does not resolve, whether missing
/// or a dangling symlink, has size 0.
///
/// # Errors
///
/// Returns [`PodfsError::SizeWalk`] if an entry cannot be read.
pub fn dir_size(path: &Path) -> PodfsResult<u64> {
    if let Err(e) = std::fs::metadata(path) {
        if e.kind() == io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), "size of missing path is zero");
            return Ok(0);
        }
        return Err(PodfsError::size_walk(path, e));
    }

    let mut seen = HashSet::new();
    let mut total: u64 = 0;

    for entry in WalkDir::new(path)
        .follow_links(false)
        .follow_root_links(false)
    {
        let entry = entry.map_err(|e| {
            let at = e.path().unwrap_or(path).to_path_buf();
            PodfsError::size_walk(at, e.into())
        })?;
        let meta = entry
            .metadata()
            .map_err(|e| PodfsError::size_walk(entry.path(), e.into()))?;

        if meta.nlink() > 1 && !meta.is_dir() && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        total += meta.len();
    }

    tracing::debug!(path = %path.display(), bytes = total, "computed tree size");
    Ok(total)
}
