//! Replication of an image tree into a pod's writable root filesystem.

use std::fs::{self, DirBuilder, File, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use podfs_common::{PodfsError, PodfsResult, ShiftRange};
use walkdir::WalkDir;

use super::platform::{
    Capabilities, DeviceKind, EntryTimes, HostPlatform, Platform, device_numbers,
};

/// Permission bits, including setuid, setgid and sticky.
const PERMISSION_MASK: u32 = 0o7777;

/// File types a tree copy can reproduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory.
    Dir,
    /// Regular file.
    Regular,
    /// Symbolic link.
    Symlink,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Named pipe.
    Fifo,
}

impl EntryKind {
    /// Classifies an entry from its `lstat` metadata. Sockets and unknown
    /// types have no destination representation.
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        let file_type = meta.file_type();
        if file_type.is_dir() {
            Some(Self::Dir)
        } else if file_type.is_file() {
            Some(Self::Regular)
        } else if file_type.is_symlink() {
            Some(Self::Symlink)
        } else if file_type.is_char_device() {
            Some(Self::CharDevice)
        } else if file_type.is_block_device() {
            Some(Self::BlockDevice)
        } else if file_type.is_fifo() {
            Some(Self::Fifo)
        } else {
            None
        }
    }
}

/// Counts of what a copy produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Directories created, including the root.
    pub directories: u64,
    /// Regular files copied.
    pub files: u64,
    /// Symlinks recreated.
    pub symlinks: u64,
    /// Device nodes created.
    pub devices: u64,
    /// Named pipes created.
    pub fifos: u64,
    /// Bytes of regular file content copied.
    pub bytes: u64,
}

impl CopyStats {
    /// Total number of entries created.
    #[must_use]
    pub const fn entries(&self) -> u64 {
        self.directories + self.files + self.symlinks + self.devices + self.fifos
    }

    const fn record(&mut self, kind: EntryKind) {
        match kind {
            EntryKind::Dir => self.directories += 1,
            EntryKind::Regular => self.files += 1,
            EntryKind::Symlink => self.symlinks += 1,
            EntryKind::CharDevice | EntryKind::BlockDevice => self.devices += 1,
            EntryKind::Fifo => self.fifos += 1,
        }
    }
}

/// Directory times held back until every entry is written, since creating
/// children updates a directory's modification time.
#[derive(Debug, Default)]
struct DirTimesLedger {
    entries: Vec<(PathBuf, PathBuf, EntryTimes)>,
}

impl DirTimesLedger {
    fn record(&mut self, target: &Path, rel: &Path, times: EntryTimes) {
        self.entries
            .push((target.to_path_buf(), rel.to_path_buf(), times));
    }

    fn apply<P: Platform + ?Sized>(self, platform: &P) -> PodfsResult<()> {
        tracing::debug!(directories = self.entries.len(), "restoring directory times");
        for (target, rel, times) in self.entries.into_iter().rev() {
            platform
                .set_times(&target, &times)
                .map_err(|e| PodfsError::tree_walk(&rel, e))?;
        }
        Ok(())
    }
}

/// State of a single [`TreeReplicator::copy_tree`] run.
struct CopyRun<'r, R: ?Sized> {
    uid_range: &'r R,
    capabilities: Capabilities,
    ledger: DirTimesLedger,
    stats: CopyStats,
}

/// Copies a directory tree entry by entry, shifting ownership through a
/// [`ShiftRange`] and reproducing permissions, special files and timestamps.
///
/// The walk does not follow symlinks, including at the root, and visits
/// entries in file name order so parents always precede their children.
#[derive(Debug, Clone, Copy)]
pub struct TreeReplicator<'a, P: Platform + ?Sized = HostPlatform> {
    platform: &'a P,
}

impl<'a, P: Platform + ?Sized> TreeReplicator<'a, P> {
    /// A replicator delegating privileged operations to `platform`.
    pub const fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// Replicates `src` at `dest`, which must not exist yet.
    ///
    /// Every entry is created with the source's permission bits, owned by
    /// `uid_range.shift_range(uid, gid)` of the source owner, with the source's
    /// access and modification times. Regular file contents are copied,
    /// symlink targets are kept verbatim and device nodes keep their numbers.
    ///
    /// When the platform's `ownership` capability is off the owner is still
    /// mapped, so range errors surface, but entries stay owned by the
    /// copying user.
    ///
    /// The first failure aborts the copy and leaves whatever was created so
    /// far in place. Errors name the entry relative to `src`, with `.` for
    /// the root.
    ///
    /// # Errors
    ///
    /// - [`PodfsError::UnsupportedEntryType`] for sockets and unknown types
    /// - [`PodfsError::Unsupported`] for a device node or fifo the platform cannot create
    /// - [`PodfsError::OwnershipShift`] when the range rejects an owner
    /// - [`PodfsError::TreeWalk`] for any traversal or I/O failure
    pub fn copy_tree<R>(&self, src: &Path, dest: &Path, uid_range: &R) -> PodfsResult<CopyStats>
    where
        R: ShiftRange + ?Sized,
    {
        tracing::info!(src = %src.display(), dest = %dest.display(), "replicating tree");
        if !self.platform.capabilities().ownership {
            tracing::debug!("ownership changes disabled, keeping the copying user as owner");
        }

        let mut run = CopyRun {
            uid_range,
            capabilities: self.platform.capabilities(),
            ledger: DirTimesLedger::default(),
            stats: CopyStats::default(),
        };

        let walker = WalkDir::new(src)
            .follow_links(false)
            .follow_root_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| walk_error(src, e))?;
            let rel = relative(src, entry.path());
            let target = if rel.as_os_str().is_empty() {
                dest.to_path_buf()
            } else {
                dest.join(rel)
            };
            let meta = entry.metadata().map_err(|e| walk_error(src, e))?;
            self.replicate_entry(&mut run, entry.path(), &target, rel, &meta)?;
        }

        run.ledger.apply(self.platform)?;

        let stats = run.stats;
        tracing::info!(
            entries = stats.entries(),
            bytes = stats.bytes,
            dest = %dest.display(),
            "tree replicated"
        );
        Ok(stats)
    }

    fn replicate_entry<R: ShiftRange + ?Sized>(
        &self,
        run: &mut CopyRun<'_, R>,
        source: &Path,
        target: &Path,
        rel: &Path,
        meta: &Metadata,
    ) -> PodfsResult<()> {
        let shown = display_path(rel);
        let at = |e: io::Error| PodfsError::tree_walk(display_path(rel), e);

        let mode = meta.mode();
        let perm = mode & PERMISSION_MASK;
        let kind = EntryKind::from_metadata(meta).ok_or_else(|| {
            PodfsError::UnsupportedEntryType {
                path: shown.clone(),
                mode,
            }
        })?;

        match kind {
            EntryKind::Dir => DirBuilder::new().mode(perm).create(target).map_err(at)?,
            EntryKind::Regular => {
                run.stats.bytes += copy_file_contents(source, target).map_err(at)?;
            }
            EntryKind::Symlink => {
                let link = fs::read_link(source).map_err(at)?;
                std::os::unix::fs::symlink(link, target).map_err(at)?;
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                require(run.capabilities.device_nodes, "device nodes", &shown)?;
                let device = if kind == EntryKind::CharDevice {
                    DeviceKind::Char
                } else {
                    DeviceKind::Block
                };
                let (major, minor) = device_numbers(meta.rdev());
                self.platform
                    .make_device(target, device, perm, major, minor)
                    .map_err(at)?;
            }
            EntryKind::Fifo => {
                require(run.capabilities.fifos, "named pipes", &shown)?;
                self.platform.make_fifo(target, perm).map_err(at)?;
            }
        }

        self.platform.copy_xattrs(source, target).map_err(at)?;

        let (uid, gid) = run
            .uid_range
            .shift_range(meta.uid(), meta.gid())
            .map_err(|source| PodfsError::OwnershipShift {
                path: shown.clone(),
                source,
            })?;
        if run.capabilities.ownership {
            self.platform.lchown(target, uid, gid).map_err(at)?;
        }

        // chown clears setuid and setgid bits, and creation was filtered by
        // the umask. Symlink permissions cannot be changed on Linux.
        if kind != EntryKind::Symlink {
            fs::set_permissions(target, Permissions::from_mode(perm)).map_err(at)?;
        }

        let times = EntryTimes::from_metadata(meta);
        match kind {
            EntryKind::Dir => run.ledger.record(target, &shown, times),
            EntryKind::Symlink => self.platform.set_link_times(target, &times).map_err(at)?,
            _ => self.platform.set_times(target, &times).map_err(at)?,
        }

        run.stats.record(kind);
        tracing::trace!(path = %shown.display(), ?kind, uid, gid, perm, "replicated entry");
        Ok(())
    }
}

/// Replicates `src` at `dest` on the detected host platform.
///
/// # Errors
///
/// See [`TreeReplicator::copy_tree`].
pub fn copy_tree<R>(src: &Path, dest: &Path, uid_range: &R) -> PodfsResult<CopyStats>
where
    R: ShiftRange + ?Sized,
{
    let platform = HostPlatform::detect();
    TreeReplicator::new(&platform).copy_tree(src, dest, uid_range)
}

fn copy_file_contents(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dest)?;
    io::copy(&mut reader, &mut writer)
}

fn require(enabled: bool, feature: &'static str, path: &Path) -> PodfsResult<()> {
    if enabled {
        Ok(())
    } else {
        Err(PodfsError::Unsupported {
            feature,
            path: path.to_path_buf(),
        })
    }
}

/// walkdir yields paths joined onto the root it was given.
fn relative<'p>(root: &Path, path: &'p Path) -> &'p Path {
    path.strip_prefix(root).unwrap_or(path)
}

fn display_path(rel: &Path) -> PathBuf {
    if rel.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        rel.to_path_buf()
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> PodfsError {
    let path = err
        .path()
        .map_or_else(|| PathBuf::from("."), |p| display_path(relative(root, p)));
    PodfsError::TreeWalk {
        path,
        source: err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podfs_common::UidRange;
    use tempfile::tempdir;

    #[test]
    fn classifies_entries() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        let link = dir.path().join("link");
        fs::write(&file, b"x").unwrap();
        std::os::unix::fs::symlink("file", &link).unwrap();

        let kind = |p: &Path| EntryKind::from_metadata(&fs::symlink_metadata(p).unwrap());
        assert_eq!(kind(dir.path()), Some(EntryKind::Dir));
        assert_eq!(kind(&file), Some(EntryKind::Regular));
        assert_eq!(kind(&link), Some(EntryKind::Symlink));
    }

    #[test]
    fn stats_count_entries() {
        let mut stats = CopyStats::default();
        stats.record(EntryKind::Dir);
        stats.record(EntryKind::Regular);
        stats.record(EntryKind::CharDevice);
        stats.record(EntryKind::BlockDevice);
        assert_eq!(stats.devices, 2);
        assert_eq!(stats.entries(), 4);
    }

    #[test]
    fn display_path_names_root() {
        assert_eq!(display_path(Path::new("")), PathBuf::from("."));
        assert_eq!(display_path(Path::new("etc/hosts")), PathBuf::from("etc/hosts"));
    }

    #[test]
    fn copies_simple_tree() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/file"), b"hello").unwrap();
        fs::write(src.join("top"), b"123").unwrap();

        let stats = copy_tree(&src, &dest, &UidRange::identity()).unwrap();

        assert_eq!(fs::read(dest.join("a/b/file")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.join("top")).unwrap(), b"123");
        assert_eq!(stats.directories, 3);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 8);
    }

    #[test]
    fn existing_destination_fails_at_root() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dest).unwrap();

        let err = copy_tree(&src, &dest, &UidRange::identity()).unwrap_err();
        match err {
            PodfsError::TreeWalk { path, source } => {
                assert_eq!(path, PathBuf::from("."));
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_source_fails() {
        let temp = tempdir().unwrap();
        let err = copy_tree(
            &temp.path().join("missing"),
            &temp.path().join("dest"),
            &UidRange::identity(),
        )
        .unwrap_err();
        assert!(matches!(err, PodfsError::TreeWalk { .. }));
        assert!(err.is_not_found());
        assert!(!temp.path().join("dest").exists());
    }

    #[test]
    fn fifo_without_capability_is_unsupported() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir(&src).unwrap();
        HostPlatform::detect().make_fifo(&src.join("pipe"), 0o644).unwrap();

        let platform = HostPlatform::with_capabilities(Capabilities {
            fifos: false,
            ..Capabilities::all()
        });
        let err = TreeReplicator::new(&platform)
            .copy_tree(&src, &temp.path().join("dest"), &UidRange::identity())
            .unwrap_err();
        assert!(matches!(
            err,
            PodfsError::Unsupported {
                feature: "named pipes",
                ..
            }
        ));
        assert_eq!(err.path(), Some(Path::new("pipe")));
    }

    #[test]
    fn without_ownership_keeps_copying_user() {
        use std::os::unix::fs::MetadataExt;

        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/hosts"), b"localhost").unwrap();
        std::os::unix::fs::symlink("hosts", src.join("etc/link")).unwrap();

        let platform =
            HostPlatform::with_capabilities(Capabilities::all().without_ownership());
        let stats = TreeReplicator::new(&platform)
            .copy_tree(&src, &dest, &UidRange::new(100_000, 1 << 24))
            .unwrap();
        assert_eq!(stats.entries(), 4);

        let uid = rustix::process::geteuid().as_raw();
        for rel in ["", "etc", "etc/hosts", "etc/link"] {
            let meta = fs::symlink_metadata(dest.join(rel)).unwrap();
            assert_eq!(meta.uid(), uid, "{rel}");
        }
    }

    #[test]
    fn without_ownership_still_checks_the_range() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir(&src).unwrap();

        let platform =
            HostPlatform::with_capabilities(Capabilities::all().without_ownership());
        let err = TreeReplicator::new(&platform)
            .copy_tree(&src, &temp.path().join("dest"), &UidRange::new(100_000, 0))
            .unwrap_err();
        assert!(matches!(err, PodfsError::OwnershipShift { .. }), "{err}");
    }
}
