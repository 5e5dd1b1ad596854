//! Advisory file locks.
//!
//! [`LockHandle`] wraps `flock(2)` on a file or directory with shared and
//! exclusive levels. [`KeyLock`] builds named locks on top of it, one file per
//! key in a lock directory.

mod handle;
mod keylock;

pub use handle::{LockHandle, LockKind, LockState};
pub use keylock::{KeyLock, clean_key_locks};
