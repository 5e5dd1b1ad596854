//! Host operations needed to reproduce special files and metadata.

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use rustix::fs::{AtFlags, CWD, FileType, Mode, Timespec, Timestamps, mknodat};

/// What a [`Platform`] can do.
///
/// A tree containing a device node or fifo whose capability is disabled
/// fails with `PodfsError::Unsupported` instead of a late permission error.
/// Without `ownership`, replicated entries keep the copying user as owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Character and block device nodes can be created.
    pub device_nodes: bool,
    /// Named pipes can be created.
    pub fifos: bool,
    /// Entries can be chowned to their shifted ids.
    pub ownership: bool,
}

impl Capabilities {
    /// Every capability enabled.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            device_nodes: true,
            fifos: true,
            ownership: true,
        }
    }

    /// The same capabilities with device node creation disabled.
    #[must_use]
    pub const fn without_device_nodes(self) -> Self {
        Self {
            device_nodes: false,
            ..self
        }
    }

    /// The same capabilities with ownership changes disabled.
    #[must_use]
    pub const fn without_ownership(self) -> Self {
        Self {
            ownership: false,
            ..self
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Kind of device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Character device.
    Char,
    /// Block device.
    Block,
}

/// A point in time as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTime {
    /// Whole seconds.
    pub secs: i64,
    /// Nanoseconds within the second.
    pub nanos: i64,
}

impl FileTime {
    /// Builds a time from seconds and nanoseconds.
    #[must_use]
    pub const fn new(secs: i64, nanos: i64) -> Self {
        Self { secs, nanos }
    }

    const fn timespec(self) -> Timespec {
        Timespec {
            tv_sec: self.secs as _,
            tv_nsec: self.nanos as _,
        }
    }
}

/// Access and modification times of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTimes {
    /// Last access.
    pub accessed: FileTime,
    /// Last modification.
    pub modified: FileTime,
}

impl EntryTimes {
    /// Reads the times from `lstat`/`stat` metadata, keeping nanoseconds.
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            accessed: FileTime::new(meta.atime(), meta.atime_nsec()),
            modified: FileTime::new(meta.mtime(), meta.mtime_nsec()),
        }
    }

    const fn timestamps(&self) -> Timestamps {
        Timestamps {
            last_access: self.accessed.timespec(),
            last_modification: self.modified.timespec(),
        }
    }
}

/// Splits a raw `st_rdev` into major and minor numbers.
#[must_use]
pub fn device_numbers(rdev: u64) -> (u32, u32) {
    (rustix::fs::major(rdev), rustix::fs::minor(rdev))
}

/// Operations a tree copy delegates to the host.
///
/// Regular files, directories and symlinks are created with `std::fs`; the
/// operations here are the ones that need privileges or special syscalls, so
/// tests and restricted environments can substitute their own.
pub trait Platform {
    /// What this platform supports.
    fn capabilities(&self) -> Capabilities;

    /// Creates a device node with permission bits `perm`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `mknod(2)`.
    fn make_device(
        &self,
        path: &Path,
        kind: DeviceKind,
        perm: u32,
        major: u32,
        minor: u32,
    ) -> io::Result<()>;

    /// Creates a named pipe with permission bits `perm`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `mknod(2)`.
    fn make_fifo(&self, path: &Path, perm: u32) -> io::Result<()>;

    /// Changes ownership without following a final symlink.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `lchown(2)`.
    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Sets access and modification times, following symlinks.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `utimensat(2)`.
    fn set_times(&self, path: &Path, times: &EntryTimes) -> io::Result<()>;

    /// Sets the times of a symlink itself.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `utimensat(2)`.
    fn set_link_times(&self, path: &Path, times: &EntryTimes) -> io::Result<()>;

    /// Copies extended attributes. The default keeps none.
    ///
    /// # Errors
    ///
    /// Implementations return the OS error of the failing attribute call.
    fn copy_xattrs(&self, _src: &Path, _dest: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// The running host, through direct syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPlatform {
    capabilities: Capabilities,
}

impl HostPlatform {
    /// Probes the host. `mknod` of a device requires `CAP_MKNOD`, so device
    /// nodes are only offered to an effective root user.
    #[must_use]
    pub fn detect() -> Self {
        let root = rustix::process::geteuid().is_root();
        let capabilities = Capabilities {
            device_nodes: root,
            ..Capabilities::all()
        };
        tracing::debug!(?capabilities, "detected host capabilities");
        Self { capabilities }
    }

    /// A host platform with explicit capabilities.
    #[must_use]
    pub const fn with_capabilities(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }
}

impl Platform for HostPlatform {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn make_device(
        &self,
        path: &Path,
        kind: DeviceKind,
        perm: u32,
        major: u32,
        minor: u32,
    ) -> io::Result<()> {
        let file_type = match kind {
            DeviceKind::Char => FileType::CharacterDevice,
            DeviceKind::Block => FileType::BlockDevice,
        };
        tracing::trace!(path = %path.display(), ?kind, major, minor, "creating device node");
        mknodat(
            CWD,
            path,
            file_type,
            Mode::from_raw_mode(perm),
            rustix::fs::makedev(major, minor),
        )?;
        Ok(())
    }

    fn make_fifo(&self, path: &Path, perm: u32) -> io::Result<()> {
        mknodat(CWD, path, FileType::Fifo, Mode::from_raw_mode(perm), 0)?;
        Ok(())
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
    }

    fn set_times(&self, path: &Path, times: &EntryTimes) -> io::Result<()> {
        rustix::fs::utimensat(CWD, path, &times.timestamps(), AtFlags::empty())?;
        Ok(())
    }

    fn set_link_times(&self, path: &Path, times: &EntryTimes) -> io::Result<()> {
        rustix::fs::utimensat(
            CWD,
            path,
            &times.timestamps(),
            AtFlags::SYMLINK_NOFOLLOW,
        )?;
        Ok(())
    }
}
