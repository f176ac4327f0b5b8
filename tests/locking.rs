//! Database file locking across independent connections to one file.

use proptest::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use wasqlite::config::VfsConfig;
use wasqlite::vfs::os::OsVfs;
use wasqlite::vfs::{Filename, LockLevel, OpenFlags, Vfs, VfsFile};

fn open(vfs: &dyn Vfs, path: &Path) -> Box<dyn VfsFile> {
    let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB;
    let name = Filename::new(path.to_str().unwrap());
    vfs.open(Some(&name), flags).unwrap().into_parts().0
}

fn vfs_for(dot_file: bool) -> Arc<dyn Vfs> {
    let config = if dot_file {
        VfsConfig::dot_file()
    } else {
        VfsConfig::default()
    };
    Arc::new(OsVfs::new(config))
}

/// Takes a write lock the way the pager does, backing off to NONE whenever
/// another connection gets there first.
fn write_lock(file: &mut dyn VfsFile) {
    loop {
        match file.lock(LockLevel::Shared) {
            Ok(()) => {}
            Err(err) if err.is_busy() => {
                thread::sleep(Duration::from_micros(50));
                continue;
            }
            Err(err) => panic!("shared: {err}"),
        }
        match file.lock(LockLevel::Reserved) {
            Ok(()) => {}
            Err(err) if err.is_busy() => {
                file.unlock(LockLevel::None).unwrap();
                thread::sleep(Duration::from_micros(50));
                continue;
            }
            Err(err) => panic!("reserved: {err}"),
        }
        loop {
            match file.lock(LockLevel::Exclusive) {
                Ok(()) => return,
                Err(err) if err.is_busy() => {
                    assert_eq!(file.lock_level(), LockLevel::Reserved);
                    thread::sleep(Duration::from_micros(50));
                }
                Err(err) => panic!("exclusive: {err}"),
            }
        }
    }
}

fn mutual_exclusion(dot_file: bool) {
    const THREADS: usize = 4;
    const ROUNDS: usize = 25;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mutex.db");
    let vfs = vfs_for(dot_file);
    let writers = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));

    let threads: Vec<_> = (0..THREADS)
        .map(|i| {
            let mut file = open(vfs.as_ref(), &path);
            let writers = Arc::clone(&writers);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for round in 0..ROUNDS {
                    write_lock(file.as_mut());
                    assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                    file.write_at(&[i as u8; 16], (round * 16) as u64).unwrap();
                    thread::yield_now();
                    assert_eq!(writers.fetch_sub(1, Ordering::SeqCst), 1);
                    file.unlock(LockLevel::Shared).unwrap();
                    file.unlock(LockLevel::None).unwrap();
                }
                file.close().unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), (ROUNDS * 16) as u64);
}

#[test]
fn exclusive_is_exclusive() {
    mutual_exclusion(false);
}

#[test]
fn exclusive_is_exclusive_with_dot_files() {
    mutual_exclusion(true);
}

#[test]
fn shared_locks_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let vfs = vfs_for(false);
    let mut files: Vec<_> = (0..4).map(|_| open(vfs.as_ref(), &path)).collect();

    for file in &mut files {
        file.lock(LockLevel::Shared).unwrap();
    }
    // A single RESERVED holder does not disturb readers.
    files[0].lock(LockLevel::Reserved).unwrap();
    for file in &files[1..] {
        assert!(file.is_write_locked().unwrap());
        assert_eq!(file.lock_level(), LockLevel::Shared);
    }
    assert!(files[1].lock(LockLevel::Reserved).unwrap_err().is_busy());
    assert!(files[0].lock(LockLevel::Exclusive).unwrap_err().is_busy());
    assert_eq!(files[0].lock_level(), LockLevel::Reserved);

    // Readers that get there first still share after RESERVED is gone.
    files[0].unlock(LockLevel::Shared).unwrap();
    for file in &files {
        assert_eq!(file.lock_level(), LockLevel::Shared);
    }
    for file in &mut files {
        file.unlock(LockLevel::None).unwrap();
        assert_eq!(file.lock_level(), LockLevel::None);
    }
}

#[test]
fn lock_timeout_waits_for_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timeout.db");
    let vfs = vfs_for(false);
    let mut holder = open(vfs.as_ref(), &path);
    let mut waiter = open(vfs.as_ref(), &path);

    holder.lock(LockLevel::Shared).unwrap();
    holder.lock(LockLevel::Exclusive).unwrap();
    waiter
        .set_lock_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        holder.unlock(LockLevel::None).unwrap();
        holder
    });
    waiter.lock(LockLevel::Shared).unwrap();
    assert_eq!(waiter.lock_level(), LockLevel::Shared);
    release.join().unwrap();
}

#[derive(Copy, Clone, Debug)]
enum Op {
    Lock(usize, LockLevel),
    Unlock(usize, LockLevel),
}

fn level() -> impl Strategy<Value = LockLevel> {
    prop_oneof![
        Just(LockLevel::None),
        Just(LockLevel::Shared),
        Just(LockLevel::Reserved),
        Just(LockLevel::Pending),
        Just(LockLevel::Exclusive),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    (0..3usize, level(), any::<bool>()).prop_map(|(i, level, lock)| {
        if lock {
            Op::Lock(i, level)
        } else {
            Op::Unlock(i, level)
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn os_files_keep_lock_invariants(
        ops in proptest::collection::vec(op(), 1..40),
        dot_file in any::<bool>(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop.db");
        let vfs = vfs_for(dot_file);
        let mut files: Vec<_> = (0..3).map(|_| open(vfs.as_ref(), &path)).collect();

        for op in ops {
            let i = match op {
                Op::Lock(i, _) | Op::Unlock(i, _) => i,
            };
            let before = files[i].lock_level();
            let result = match op {
                Op::Lock(_, level) => files[i].lock(level),
                Op::Unlock(_, level) => files[i].unlock(level),
            };
            let after = files[i].lock_level();
            match result {
                Ok(()) => match op {
                    Op::Lock(_, level) => prop_assert_eq!(after, before.max(level)),
                    Op::Unlock(_, level) => prop_assert_eq!(after, before.min(level)),
                },
                Err(_) => prop_assert_eq!(before, after),
            }
            prop_assert!(after != LockLevel::Pending);

            let writers = files.iter().filter(|f| f.lock_level() >= LockLevel::Reserved).count();
            prop_assert!(writers <= 1);
            if files.iter().any(|f| f.lock_level() == LockLevel::Exclusive) {
                let holders = files.iter().filter(|f| f.lock_level() > LockLevel::None).count();
                prop_assert_eq!(holders, 1);
            }
        }
        for file in &mut files {
            file.unlock(LockLevel::None).unwrap();
            file.close().unwrap();
        }
    }
}
