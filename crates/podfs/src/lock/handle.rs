//! Advisory lock over a single file or directory.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use podfs_common::{PodfsError, PodfsResult};
use rustix::fs::{FileType, FlockOperation, Mode, OFlags};
use rustix::io::Errno;

/// What a [`LockHandle`] is opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// The path must be a directory.
    Directory,
    /// The path must be a regular file.
    RegularFile,
}

impl LockKind {
    const fn describe(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::RegularFile => "regular file",
        }
    }
}

/// Lock level currently held through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    /// No lock held.
    #[default]
    Unlocked,
    /// A shared lock, compatible with other shared holders.
    Shared,
    /// An exclusive lock.
    Exclusive,
}

impl LockState {
    const fn operation(self, blocking: bool) -> Option<FlockOperation> {
        match (self, blocking) {
            (Self::Unlocked, _) => None,
            (Self::Shared, true) => Some(FlockOperation::LockShared),
            (Self::Shared, false) => Some(FlockOperation::NonBlockingLockShared),
            (Self::Exclusive, true) => Some(FlockOperation::LockExclusive),
            (Self::Exclusive, false) => Some(FlockOperation::NonBlockingLockExclusive),
        }
    }
}

/// An open descriptor on a path, carrying an advisory `flock(2)` lock.
///
/// A handle is owned by one holder; the lock is per open file description, so
/// two handles on the same path contend with each other even inside a single
/// process. Dropping the handle closes the descriptor and releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    fd: Option<OwnedFd>,
    kind: LockKind,
    state: LockState,
}

impl LockHandle {
    /// Opens `path` without acquiring any lock.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::LockTargetMissing`], [`PodfsError::LockTargetPermission`]
    /// or [`PodfsError::LockTargetWrongType`] when the path cannot be used.
    pub fn open(path: impl Into<PathBuf>, kind: LockKind) -> PodfsResult<Self> {
        let path = path.into();

        // NONBLOCK keeps a fifo or device from stalling the open before its type is checked.
        let mut flags = OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NONBLOCK;
        if kind == LockKind::Directory {
            flags |= OFlags::DIRECTORY;
        }
        let fd = rustix::fs::open(path.as_path(), flags, Mode::empty())
            .map_err(|e| open_error(&path, kind, e))?;

        if kind == LockKind::RegularFile {
            let stat = rustix::fs::fstat(&fd).map_err(|e| os_error(&path, e))?;
            if FileType::from_raw_mode(stat.st_mode as _) != FileType::RegularFile {
                return Err(PodfsError::LockTargetWrongType {
                    path,
                    expected: kind.describe(),
                });
            }
        }

        tracing::trace!(path = %path.display(), ?kind, "opened lock handle");
        Ok(Self {
            path,
            fd: Some(fd),
            kind,
            state: LockState::Unlocked,
        })
    }

    /// Opens `path` and takes an exclusive lock without blocking.
    ///
    /// # Errors
    ///
    /// See [`LockHandle::open`] and [`LockHandle::try_exclusive`].
    pub fn try_exclusive_at(path: impl Into<PathBuf>, kind: LockKind) -> PodfsResult<Self> {
        let mut lock = Self::open(path, kind)?;
        lock.try_exclusive()?;
        Ok(lock)
    }

    /// Opens `path` and waits for an exclusive lock.
    ///
    /// # Errors
    ///
    /// See [`LockHandle::open`] and [`LockHandle::exclusive`].
    pub fn exclusive_at(path: impl Into<PathBuf>, kind: LockKind) -> PodfsResult<Self> {
        let mut lock = Self::open(path, kind)?;
        lock.exclusive()?;
        Ok(lock)
    }

    /// Opens `path` and takes a shared lock without blocking.
    ///
    /// # Errors
    ///
    /// See [`LockHandle::open`] and [`LockHandle::try_shared`].
    pub fn try_shared_at(path: impl Into<PathBuf>, kind: LockKind) -> PodfsResult<Self> {
        let mut lock = Self::open(path, kind)?;
        lock.try_shared()?;
        Ok(lock)
    }

    /// Opens `path` and waits for a shared lock.
    ///
    /// # Errors
    ///
    /// See [`LockHandle::open`] and [`LockHandle::shared`].
    pub fn shared_at(path: impl Into<PathBuf>, kind: LockKind) -> PodfsResult<Self> {
        let mut lock = Self::open(path, kind)?;
        lock.shared()?;
        Ok(lock)
    }

    /// The path this handle was opened on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The kind of target.
    #[must_use]
    pub const fn kind(&self) -> LockKind {
        self.kind
    }

    /// The lock level currently held.
    #[must_use]
    pub const fn state(&self) -> LockState {
        self.state
    }

    /// Whether [`LockHandle::close`] has been called.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// The underlying descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::LockClosed`] once the handle is closed.
    pub fn as_fd(&self) -> PodfsResult<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd).ok_or_else(|| self.closed())
    }

    /// Takes an exclusive lock without blocking, promoting a shared lock.
    ///
    /// Succeeds immediately if the handle is already exclusive.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::Locked`] if any other handle holds a lock.
    pub fn try_exclusive(&mut self) -> PodfsResult<()> {
        self.acquire(LockState::Exclusive, false)
    }

    /// Waits for an exclusive lock, promoting a shared lock.
    ///
    /// There is no timeout; poll [`LockHandle::try_exclusive`] for bounded waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is closed or the OS rejects the call.
    pub fn exclusive(&mut self) -> PodfsResult<()> {
        self.acquire(LockState::Exclusive, true)
    }

    /// Takes a shared lock without blocking, demoting an exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::Locked`] while another handle holds an exclusive lock.
    pub fn try_shared(&mut self) -> PodfsResult<()> {
        self.acquire(LockState::Shared, false)
    }

    /// Waits for a shared lock, demoting an exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is closed or the OS rejects the call.
    pub fn shared(&mut self) -> PodfsResult<()> {
        self.acquire(LockState::Shared, true)
    }

    /// Releases whatever lock is held. Unlocking an unlocked handle succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::LockClosed`] once the handle is closed.
    pub fn unlock(&mut self) -> PodfsResult<()> {
        let fd = self.as_fd()?;
        if self.state == LockState::Unlocked {
            return Ok(());
        }
        flock_retrying(fd, FlockOperation::Unlock).map_err(|e| os_error(&self.path, e))?;
        self.set_state(LockState::Unlocked);
        Ok(())
    }

    /// Closes the descriptor, which releases any lock held through it.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::LockClosed`] if the handle was already closed.
    pub fn close(&mut self) -> PodfsResult<()> {
        let fd = self.fd.take().ok_or_else(|| self.closed())?;
        drop(fd);
        let previous = std::mem::take(&mut self.state);
        tracing::debug!(path = %self.path.display(), ?previous, "closed lock handle");
        Ok(())
    }

    /// Whether the locked descriptor still refers to the file now at `path`.
    ///
    /// A lock only protects the live path while both have the same device and
    /// inode; once the path is unlinked or replaced this returns `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is closed or either stat fails for a
    /// reason other than the path being gone.
    pub fn is_current(&self) -> PodfsResult<bool> {
        let fd = self.as_fd()?;
        let held = rustix::fs::fstat(fd).map_err(|e| os_error(&self.path, e))?;
        match rustix::fs::stat(self.path.as_path()) {
            Ok(now) => Ok(held.st_dev == now.st_dev && held.st_ino == now.st_ino),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(os_error(&self.path, e)),
        }
    }

    pub(crate) fn acquire(&mut self, target: LockState, blocking: bool) -> PodfsResult<()> {
        let fd = self.as_fd()?;
        if self.state == target {
            return Ok(());
        }
        let Some(operation) = target.operation(blocking) else {
            return self.unlock();
        };

        let result = if blocking {
            flock_retrying(fd, operation)
        } else {
            rustix::fs::flock(fd, operation)
        };

        match result {
            Ok(()) => {
                self.set_state(target);
                Ok(())
            }
            Err(e) => {
                self.recover_after_failed_conversion();
                if e == Errno::WOULDBLOCK && !blocking {
                    Err(PodfsError::Locked {
                        path: self.path.clone(),
                    })
                } else {
                    Err(os_error(&self.path, e))
                }
            }
        }
    }

    /// flock(2) converts a lock by dropping the old one before taking the new
    /// one, so a failed conversion can leave nothing held. Re-take the previous
    /// level if nobody grabbed it meanwhile and record what is actually held.
    fn recover_after_failed_conversion(&mut self) {
        let previous = self.state;
        let Some(operation) = previous.operation(false) else {
            return;
        };
        let Some(fd) = self.fd.as_ref() else {
            return;
        };
        if rustix::fs::flock(fd, operation).is_err() {
            tracing::warn!(
                path = %self.path.display(),
                ?previous,
                "lock level lost during a failed conversion"
            );
            self.set_state(LockState::Unlocked);
        }
    }

    fn set_state(&mut self, next: LockState) {
        tracing::debug!(
            path = %self.path.display(),
            from = ?self.state,
            to = ?next,
            "lock state changed"
        );
        self.state = next;
    }

    fn closed(&self) -> PodfsError {
        PodfsError::LockClosed {
            path: self.path.clone(),
        }
    }
}

fn flock_retrying(fd: BorrowedFd<'_>, operation: FlockOperation) -> rustix::io::Result<()> {
    loop {
        match rustix::fs::flock(fd, operation) {
            Err(Errno::INTR) => {}
            other => return other,
        }
    }
}

fn open_error(path: &Path, kind: LockKind, err: Errno) -> PodfsError {
    let path = path.to_path_buf();
    match err {
        Errno::NOENT => PodfsError::LockTargetMissing { path },
        Errno::ACCESS | Errno::PERM => PodfsError::LockTargetPermission { path },
        Errno::NOTDIR if kind == LockKind::Directory => PodfsError::LockTargetWrongType {
            path,
            expected: kind.describe(),
        },
        e => PodfsError::Lock {
            path,
            source: e.into(),
        },
    }
}

fn os_error(path: &Path, err: Errno) -> PodfsError {
    PodfsError::Lock {
        path: path.to_path_buf(),
        source: err.into(),
    }
}
