//! Dot-file locking, for filesystems without working advisory locks.
//!
//! A database is locked across processes by creating a `<name>.lock`
//! directory. Within the process, the levels of every file sharing that
//! directory are tracked in [`DotLocks`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::ffi;
use crate::vfs::lock::LockBackend;
use crate::vfs::{LockLevel, Result};

#[derive(Debug, Default)]
struct Entry {
    shared: u32,
    pending: bool,
    reserved: bool,
}

/// The dot-file locks this process holds, by database path.
#[derive(Debug, Default)]
pub struct DotLocks {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl DotLocks {
    /// A lock backend for the database at `path`.
    pub fn backend(self: &Arc<Self>, path: &Path) -> DotLockBackend {
        DotLockBackend {
            locks: Arc::clone(self),
            path: path.to_path_buf(),
        }
    }

    /// Creates the `<path>.lock` directory, failing with `SQLITE_BUSY` if
    /// another process holds it.
    pub(crate) fn create_dir(path: &Path) -> Result<()> {
        match fs::create_dir(lock_dir(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(Error::io(ffi::SQLITE_BUSY, err)),
            Err(err) => Err(Error::io(ffi::SQLITE_IOERR_LOCK, err)),
        }
    }

    /// Removes the `<path>.lock` directory.
    pub(crate) fn remove_dir(path: &Path) -> Result<()> {
        match fs::remove_dir(lock_dir(path)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(Error::io(ffi::SQLITE_IOERR_UNLOCK, err)),
            _ => Ok(()),
        }
    }
}

fn lock_dir(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// The [`LockBackend`] of one file locked with a dot-file.
pub struct DotLockBackend {
    locks: Arc<DotLocks>,
    path: PathBuf,
}

impl DotLockBackend {
    fn with_entry<T>(&self, f: impl FnOnce(&mut Entry) -> Result<T>) -> Result<T> {
        let mut entries = self.locks.entries.lock();
        let entry = entries
            .get_mut(&self.path)
            .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_LOCK))?;
        f(entry)
    }

    fn clear(entry: &mut Entry, from: LockLevel) {
        if from >= LockLevel::Reserved {
            entry.reserved = false;
        }
        if from >= LockLevel::Pending {
            entry.pending = false;
        }
    }
}

impl LockBackend for DotLockBackend {
    fn shared(&mut self, _timeout: Option<Duration>) -> Result<()> {
        let mut entries = self.locks.entries.lock();
        if !entries.contains_key(&self.path) {
            DotLocks::create_dir(&self.path)?;
        }
        let entry = entries.entry(self.path.clone()).or_default();
        if entry.pending {
            return Err(Error::new(ffi::SQLITE_BUSY));
        }
        entry.shared += 1;
        Ok(())
    }

    fn reserved(&mut self, _timeout: Option<Duration>) -> Result<()> {
        self.with_entry(|entry| {
            if entry.reserved {
                return Err(Error::new(ffi::SQLITE_BUSY));
            }
            entry.reserved = true;
            Ok(())
        })
    }

    fn pending(&mut self) -> Result<()> {
        self.with_entry(|entry| {
            if entry.pending {
                return Err(Error::new(ffi::SQLITE_BUSY));
            }
            entry.pending = true;
            Ok(())
        })
    }

    fn exclusive(&mut self, _timeout: Option<Duration>) -> Result<()> {
        self.with_entry(|entry| {
            if entry.shared > 1 {
                return Err(Error::new(ffi::SQLITE_BUSY));
            }
            Ok(())
        })
    }

    fn release_pending(&mut self) -> Result<()> {
        self.with_entry(|entry| {
            entry.pending = false;
            Ok(())
        })
    }

    fn downgrade(&mut self, from: LockLevel) -> Result<()> {
        self.with_entry(|entry| {
            Self::clear(entry, from);
            Ok(())
        })
    }

    fn release(&mut self, from: LockLevel) -> Result<()> {
        let mut entries = self.locks.entries.lock();
        let Some(entry) = entries.get_mut(&self.path) else {
            return Ok(());
        };
        Self::clear(entry, from);
        if entry.shared > 1 {
            entry.shared -= 1;
            return Ok(());
        }
        entries.remove(&self.path);
        DotLocks::remove_dir(&self.path)
    }

    fn check_reserved(&self) -> Result<bool> {
        let entries = self.locks.entries.lock();
        Ok(entries.get(&self.path).is_some_and(|entry| entry.reserved))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vfs::lock::FileLock;

    const NOW: Option<Duration> = Some(Duration::ZERO);

    #[test]
    fn test_dot_lock_levels() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let locks = Arc::new(DotLocks::default());
        let mut f1 = FileLock::new(locks.backend(&db));
        let mut f2 = FileLock::new(locks.backend(&db));

        f1.lock(LockLevel::Shared, false, NOW).unwrap();
        assert!(dir.path().join("test.db.lock").is_dir());
        f2.lock(LockLevel::Shared, false, NOW).unwrap();
        f1.lock(LockLevel::Reserved, false, NOW).unwrap();
        assert!(f2.check_reserved().unwrap());
        assert!(f2.lock(LockLevel::Reserved, false, NOW).unwrap_err().is_busy());
        assert!(f1.lock(LockLevel::Exclusive, false, NOW).unwrap_err().is_busy());
        assert_eq!(f1.level(), LockLevel::Reserved);

        f2.unlock(LockLevel::None).unwrap();
        f1.lock(LockLevel::Exclusive, false, NOW).unwrap();
        assert!(f2.lock(LockLevel::Shared, false, NOW).unwrap_err().is_busy());

        f1.unlock(LockLevel::None).unwrap();
        assert!(!dir.path().join("test.db.lock").exists());
    }

    #[test]
    fn test_foreign_lock_dir_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        fs::create_dir(dir.path().join("test.db.lock")).unwrap();
        let locks = Arc::new(DotLocks::default());
        let mut file = FileLock::new(locks.backend(&db));
        assert!(file.lock(LockLevel::Shared, false, NOW).unwrap_err().is_busy());
        assert_eq!(file.level(), LockLevel::None);
    }
}
