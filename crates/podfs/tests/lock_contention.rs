//! Lock behaviour between independent holders.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use podfs::lock::{KeyLock, LockHandle, LockKind, LockState};
use podfs::{LockWait, PodfsConfig, prepare_pod};
use podfs_common::PodId;
use tempfile::tempdir;

#[test_log::test]
fn blocking_exclusive_waits_for_release() {
    let dir = tempdir().unwrap();
    let mut holder = LockHandle::try_exclusive_at(dir.path(), LockKind::Directory).unwrap();

    let path = dir.path().to_path_buf();
    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let mut lock = LockHandle::open(&path, LockKind::Directory).unwrap();
        lock.exclusive().unwrap();
        tx.send(()).unwrap();
        lock
    });

    thread::sleep(Duration::from_millis(200));
    assert!(rx.try_recv().is_err(), "waiter acquired a held lock");

    holder.unlock().unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let lock = waiter.join().unwrap();
    assert_eq!(lock.state(), LockState::Exclusive);
    assert!(holder.try_shared().unwrap_err().is_locked());
}

#[test_log::test]
fn blocking_shared_waits_for_exclusive_holder() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lockfile");
    std::fs::write(&path, b"").unwrap();
    let mut holder = LockHandle::exclusive_at(&path, LockKind::RegularFile).unwrap();

    let waiter_path = path.clone();
    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let lock = LockHandle::shared_at(&waiter_path, LockKind::RegularFile).unwrap();
        tx.send(()).unwrap();
        lock
    });

    thread::sleep(Duration::from_millis(200));
    assert!(rx.try_recv().is_err());

    holder.try_shared().unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let reader = waiter.join().unwrap();
    assert_eq!(reader.state(), LockState::Shared);
    assert_eq!(holder.state(), LockState::Shared);
}

#[test_log::test]
fn key_lock_waits_across_threads() {
    let dir = tempdir().unwrap();
    let held = KeyLock::exclusive(dir.path(), "sha512-ab12").unwrap();

    let lock_dir = dir.path().to_path_buf();
    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let lock = KeyLock::shared(&lock_dir, "sha512-ab12").unwrap();
        tx.send(()).unwrap();
        lock
    });

    thread::sleep(Duration::from_millis(200));
    assert!(rx.try_recv().is_err());

    drop(held);
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(waiter.join().unwrap().state(), LockState::Shared);
}

#[test_log::test]
fn prepare_waits_for_pod_lock() {
    let temp = tempdir().unwrap();
    let config = PodfsConfig::default().with_root(temp.path().join("root"));
    let image = temp.path().join("image");
    std::fs::create_dir_all(image.join("bin")).unwrap();
    std::fs::write(image.join("bin/app"), b"app").unwrap();

    let pod = PodId::new("waiting-pod").unwrap();
    std::fs::create_dir_all(config.paths.pod(&pod)).unwrap();
    let mut holder =
        LockHandle::try_exclusive_at(config.paths.pod(&pod), LockKind::Directory).unwrap();

    let worker_config = config.clone();
    let worker_pod = pod.clone();
    let worker = thread::spawn(move || {
        prepare_pod(&worker_config, &worker_pod, &image, LockWait::Block)
    });

    thread::sleep(Duration::from_millis(200));
    assert!(!config.paths.pod_rootfs(&pod).exists());

    holder.close().unwrap();
    let prepared = worker.join().unwrap().unwrap();
    assert_eq!(
        std::fs::read(prepared.rootfs.join("bin/app")).unwrap(),
        b"app"
    );
}
