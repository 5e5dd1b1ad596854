//! Named locks backed by one regular file per key inside a lock directory.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use podfs_common::{PodfsError, PodfsResult};

use super::handle::{LockHandle, LockKind, LockState};

/// A lock on `<lock_dir>/<key>`.
///
/// Acquisition creates the key file on demand and, after locking, checks that
/// the locked file is still the one at the key path. A concurrent
/// [`clean_key_locks`] may unlink a key file between the open and the lock,
/// in which case acquisition starts over on the fresh file.
#[derive(Debug)]
pub struct KeyLock {
    key: String,
    handle: LockHandle,
}

impl KeyLock {
    /// Waits for an exclusive lock on `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::InvalidLockKey`] for a bad key, or an error from
    /// creating or locking the key file.
    pub fn exclusive(lock_dir: &Path, key: &str) -> PodfsResult<Self> {
        Self::acquire(lock_dir, key, LockState::Exclusive, true)
    }

    /// Takes an exclusive lock on `key` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::Locked`] if another holder has the key.
    pub fn try_exclusive(lock_dir: &Path, key: &str) -> PodfsResult<Self> {
        Self::acquire(lock_dir, key, LockState::Exclusive, false)
    }

    /// Waits for a shared lock on `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::InvalidLockKey`] for a bad key, or an error from
    /// creating or locking the key file.
    pub fn shared(lock_dir: &Path, key: &str) -> PodfsResult<Self> {
        Self::acquire(lock_dir, key, LockState::Shared, true)
    }

    /// Takes a shared lock on `key` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::Locked`] if an exclusive holder has the key.
    pub fn try_shared(lock_dir: &Path, key: &str) -> PodfsResult<Self> {
        Self::acquire(lock_dir, key, LockState::Shared, false)
    }

    fn acquire(lock_dir: &Path, key: &str, level: LockState, blocking: bool) -> PodfsResult<Self> {
        validate_key(key)?;
        let path = lock_dir.join(key);

        loop {
            create_key_file(&path)?;

            let mut handle = match LockHandle::open(&path, LockKind::RegularFile) {
                Ok(handle) => handle,
                Err(PodfsError::LockTargetMissing { .. }) => continue,
                Err(e) => return Err(e),
            };
            handle.acquire(level, blocking)?;

            if handle.is_current()? {
                tracing::trace!(key, ?level, "acquired key lock");
                return Ok(Self {
                    key: key.to_string(),
                    handle,
                });
            }
            tracing::debug!(key, "key file replaced while locking, retrying");
        }
    }

    /// The key this lock guards.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path of the key file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// The lock level currently held.
    #[must_use]
    pub const fn state(&self) -> LockState {
        self.handle.state()
    }

    /// Promotes to an exclusive lock, waiting for other holders.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is closed or the OS rejects the call.
    pub fn exclusive_lock(&mut self) -> PodfsResult<()> {
        self.handle.exclusive()
    }

    /// Demotes to a shared lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is closed or the OS rejects the call.
    pub fn shared_lock(&mut self) -> PodfsResult<()> {
        self.handle.shared()
    }

    /// Releases the lock but keeps the key file open.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::LockClosed`] after [`KeyLock::close`].
    pub fn unlock(&mut self) -> PodfsResult<()> {
        self.handle.unlock()
    }

    /// Closes the key file, releasing the lock.
    ///
    /// # Errors
    ///
    /// Returns [`PodfsError::LockClosed`] if already closed.
    pub fn close(&mut self) -> PodfsResult<()> {
        self.handle.close()
    }
}

/// Removes every key file in `lock_dir` that nobody currently holds.
///
/// Returns the number of files removed. A missing directory has nothing to
/// clean.
///
/// # Errors
///
/// Returns an error if the directory cannot be read or a free key file cannot
/// be removed.
pub fn clean_key_locks(lock_dir: &Path) -> PodfsResult<usize> {
    let entries = match fs::read_dir(lock_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(dir_error(lock_dir, e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| dir_error(lock_dir, e))?;
        let file_type = entry.file_type().map_err(|e| dir_error(lock_dir, e))?;
        if !file_type.is_file() {
            continue;
        }
        let Some(key) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };

        let mut lock = match KeyLock::try_exclusive(lock_dir, &key) {
            Ok(lock) => lock,
            Err(e) if e.is_locked() => {
                tracing::debug!(key = %key, "key lock in use, keeping");
                continue;
            }
            Err(e) => return Err(e),
        };
        fs::remove_file(lock.path()).map_err(|e| dir_error(lock.path(), e))?;
        lock.close()?;
        removed += 1;
    }

    tracing::info!(dir = %lock_dir.display(), removed, "cleaned key locks");
    Ok(removed)
}

fn validate_key(key: &str) -> PodfsResult<()> {
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\0']) {
        return Err(PodfsError::InvalidLockKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn create_key_file(path: &Path) -> PodfsResult<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .map(drop)
        .map_err(|e| dir_error(path, e))
}

fn dir_error(path: &Path, source: io::Error) -> PodfsError {
    PodfsError::Lock {
        path: path.to_path_buf(),
        source,
    }
}
