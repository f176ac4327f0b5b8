//! Files on the host filesystem.
//!
//! [`OsVfs`] opens real files with positional I/O, locks them with the
//! strategy chosen in [`VfsConfig`], and backs the WAL-index of main
//! databases with a [`SharedMemory`].

pub mod dotlock;
#[cfg(unix)]
pub(crate) mod unix;
#[cfg(windows)]
pub(crate) mod windows;

#[cfg(unix)]
use self::unix as sys;
#[cfg(windows)]
use self::windows as sys;

use rand::RngCore;
use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use self::dotlock::DotLocks;
use crate::config::{Locking, SharedMemoryMode, VfsConfig};
use crate::error::{Error, IoResultExt};
use crate::ffi;
use crate::vfs::lock::{FileLock, LockBackend, NoLock, Protocol, RangeBackend};
use crate::vfs::shm::shadow::{ShadowRegistry, ShadowShm};
use crate::vfs::{
    AccessFlag, FileType, Filename, FullPathname, IoCapabilities, LockLevel, OpenFile, OpenFlags,
    Result, SharedMemory, SyncOptions, Vfs, VfsFile,
};

/// Sector size reported for every file.
const SECTOR_SIZE: u32 = 4096;

/// Milliseconds from the Julian day epoch to the Unix epoch.
const UNIX_EPOCH_JULIAN_MS: i64 = 24_405_875 * 8_640_000;

/// Fills `buf` from the operating system's random source.
pub fn random_bytes(buf: &mut [u8]) {
    rand::rng().fill_bytes(buf);
}

/// Sleeps the calling thread.
pub fn sleep_micros(micros: u64) {
    thread::sleep(Duration::from_micros(micros));
}

/// Milliseconds since noon, November 24, 4714 BC, at `time`.
///
/// See [`xCurrentTimeInt64`](https://sqlite.org/c3ref/vfs.html).
pub fn julian_day_millis(time: SystemTime) -> i64 {
    let since_epoch = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    };
    UNIX_EPOCH_JULIAN_MS + since_epoch
}

/// The host filesystem.
pub struct OsVfs {
    config: VfsConfig,
    dot_locks: Arc<DotLocks>,
    shadows: Arc<ShadowRegistry>,
}

impl Default for OsVfs {
    fn default() -> Self {
        Self::new(VfsConfig::default())
    }
}

impl OsVfs {
    pub fn new(config: VfsConfig) -> Self {
        OsVfs {
            config,
            dot_locks: Arc::default(),
            shadows: Arc::default(),
        }
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    fn lock_backend(&self, file: &Arc<File>, path: &Path, nolock: bool) -> Box<dyn LockBackend> {
        match self.config.locking {
            _ if nolock => Box::new(NoLock),
            Locking::None => Box::new(NoLock),
            Locking::DotFile => Box::new(self.dot_locks.backend(path)),
            Locking::Native => Box::new(RangeBackend::new(Arc::clone(file), Protocol::NATIVE)),
        }
    }

    fn shared_memory(&self, path: &Path) -> Option<Box<dyn SharedMemory>> {
        let shm_path = suffixed(path, "-shm");
        match self.config.shared_memory() {
            #[cfg(unix)]
            SharedMemoryMode::Mapped => Some(Box::new(crate::vfs::shm::mapped::MappedShm::new(shm_path))),
            #[cfg(not(unix))]
            SharedMemoryMode::Mapped => None,
            SharedMemoryMode::Shadow => Some(Box::new(ShadowShm::new(
                &self.shadows,
                shm_path,
                self.config.locking == Locking::DotFile,
            ))),
            SharedMemoryMode::Disabled => None,
        }
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn temp_path() -> PathBuf {
    let mut id = [0u8; 8];
    random_bytes(&mut id);
    let name: String = id.iter().map(|b| format!("{b:02x}")).collect();
    env::temp_dir().join(format!("wasqlite_{name}.tmp"))
}

fn open_error(err: io::Error, path: &Path) -> Error {
    if path.is_dir() {
        return Error::io(ffi::SQLITE_CANTOPEN_ISDIR, err);
    }
    Error::io(ffi::SQLITE_CANTOPEN, err)
}

impl Vfs for OsVfs {
    fn open(&self, name: Option<&Filename>, flags: OpenFlags) -> Result<OpenFile> {
        let (path, temp) = match name.filter(|n| !n.path().is_empty()) {
            Some(name) => (PathBuf::from(name.path()), false),
            None => (temp_path(), true),
        };
        let mut flags = flags;
        if temp {
            flags |= OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE;
            flags.remove(OpenFlags::READONLY);
        }

        let file = match sys::open(&path, flags, temp) {
            Ok(file) => file,
            // Fall back to read-only, and tell the engine.
            Err(err)
                if err.kind() == io::ErrorKind::PermissionDenied
                    && flags.contains(OpenFlags::READWRITE)
                    && !flags.contains(OpenFlags::CREATE) =>
            {
                flags.remove(OpenFlags::READWRITE);
                flags.insert(OpenFlags::READONLY);
                sys::open(&path, flags, false).map_err(|err| open_error(err, &path))?
            }
            Err(err) => return Err(open_error(err, &path)),
        };
        let file = Arc::new(file);
        let ty = flags.file_type();
        let nolock = name.is_some_and(|n| n.uri_boolean("nolock", false));

        let sync_dir = !temp
            && flags.contains(OpenFlags::CREATE)
            && matches!(ty, Some(FileType::MainJournal | FileType::SuperJournal | FileType::Wal));
        let shm = match (ty, temp) {
            (Some(FileType::MainDb), false) => self.shared_memory(&path),
            _ => None,
        };
        log::debug!("open {} {:?}", path.display(), flags);

        let os_file = OsFile {
            lock: FileLock::from_box(self.lock_backend(&file, &path, nolock)),
            file,
            readonly: flags.contains(OpenFlags::READONLY),
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE),
            sync_dir,
            lock_timeout: Some(Duration::ZERO),
            psow: name.map_or(true, |n| n.uri_boolean("psow", true)),
            persist_wal: false,
            chunk_size: 0,
            shm,
            path,
        };
        Ok(OpenFile::new(os_file, flags))
    }

    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        let path = Path::new(name);
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::io(ffi::SQLITE_IOERR_DELETE_NOENT, err))
            }
            Err(err) => return Err(Error::io(ffi::SQLITE_IOERR_DELETE, err)),
        }
        if sync_dir {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                sys::sync_dir(dir).or_code(ffi::SQLITE_IOERR_DIR_FSYNC)?;
            }
        }
        Ok(())
    }

    fn access(&self, name: &str, flag: AccessFlag) -> Result<bool> {
        let meta = match fs::metadata(name) {
            Ok(meta) => meta,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                return Ok(false)
            }
            Err(err) => return Err(Error::io(ffi::SQLITE_IOERR_ACCESS, err)),
        };
        Ok(match flag {
            AccessFlag::Exists | AccessFlag::Read => true,
            AccessFlag::ReadWrite => !meta.permissions().readonly(),
        })
    }

    fn full_pathname(&self, name: &str) -> Result<FullPathname> {
        let path = Path::new(name);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()
                .or_code(ffi::SQLITE_CANTOPEN_FULLPATH)?
                .join(path)
        };
        let symlink = fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink());
        let path = path
            .into_os_string()
            .into_string()
            .map_err(|_| Error::new(ffi::SQLITE_CANTOPEN_FULLPATH))?;
        Ok(FullPathname { path, symlink })
    }
}

/// A file opened by [`OsVfs`].
pub struct OsFile {
    file: Arc<File>,
    path: PathBuf,
    lock: FileLock,
    lock_timeout: Option<Duration>,
    readonly: bool,
    delete_on_close: bool,
    sync_dir: bool,
    psow: bool,
    persist_wal: bool,
    chunk_size: u64,
    shm: Option<Box<dyn SharedMemory>>,
}

impl OsFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn round_to_chunk(&self, size: u64) -> u64 {
        if self.chunk_size > 0 {
            size.div_ceil(self.chunk_size) * self.chunk_size
        } else {
            size
        }
    }
}

impl VfsFile for OsFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match sys::read_at(&self.file, &mut buf[n..], offset + n as u64) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if n == 0 => return Err(Error::io(ffi::SQLITE_IOERR_READ, err)),
                Err(err) => {
                    log::debug!("short read of {}: {err}", self.path.display());
                    break;
                }
            }
        }
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        sys::write_all_at(&self.file, buf, offset).or_code(ffi::SQLITE_IOERR_WRITE)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let size = self.round_to_chunk(size);
        self.file.set_len(size).or_code(ffi::SQLITE_IOERR_TRUNCATE)
    }

    fn sync(&mut self, op: SyncOptions) -> Result<()> {
        sys::sync(&self.file, op).or_code(ffi::SQLITE_IOERR_FSYNC)?;
        if self.sync_dir {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                sys::sync_dir(dir).or_code(ffi::SQLITE_IOERR_DIR_FSYNC)?;
            }
            self.sync_dir = false;
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata().or_code(ffi::SQLITE_IOERR_SEEK)?.len())
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.lock(level, self.readonly, self.lock_timeout)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.unlock(level)
    }

    fn is_write_locked(&self) -> Result<bool> {
        self.lock.check_reserved()
    }

    fn lock_level(&self) -> LockLevel {
        self.lock.level()
    }

    fn sector_len(&self) -> u32 {
        SECTOR_SIZE
    }

    fn io_capabilities(&self) -> IoCapabilities {
        if self.psow {
            IoCapabilities::POWERSAFE_OVERWRITE
        } else {
            IoCapabilities::empty()
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(shm) = self.shm.as_mut() {
            shm.close();
        }
        let unlocked = self.lock.unlock(LockLevel::None);
        if self.delete_on_close {
            self.delete_on_close = false;
            if let Err(err) = fs::remove_file(&self.path) {
                log::warn!("cannot delete {}: {err}", self.path.display());
            }
        }
        unlocked
    }

    fn hint_size(&mut self, size: u64) -> Result<()> {
        let size = self.round_to_chunk(size);
        sys::allocate(&self.file, size).or_code(ffi::SQLITE_IOERR_TRUNCATE)
    }

    fn hint_overwrite(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        self.chunk_size = u64::from(size);
        Ok(())
    }

    fn has_moved(&self) -> Result<bool> {
        match sys::same_file(&self.file, &self.path) {
            Ok(same) => Ok(!same),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(Error::io(ffi::SQLITE_IOERR_FSTAT, err)),
        }
    }

    fn commit_phase_two(&mut self) -> Result<()> {
        Ok(())
    }

    fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout
    }

    fn set_lock_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Duration>> {
        Ok(std::mem::replace(&mut self.lock_timeout, timeout))
    }

    fn is_wal_persistent(&self) -> bool {
        self.persist_wal
    }

    fn set_wal_persistent(&mut self, persist: bool) {
        self.persist_wal = persist;
    }

    fn is_powersafe_overwrite(&self) -> bool {
        self.psow
    }

    fn set_powersafe_overwrite(&mut self, powersafe: bool) -> Result<()> {
        self.psow = powersafe;
        Ok(())
    }

    fn shared_memory(&mut self) -> Option<&mut dyn SharedMemory> {
        match self.shm {
            Some(ref mut shm) => Some(&mut **shm),
            None => None,
        }
    }
}

impl Drop for OsFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("cannot close {}: {err}", self.path.display());
        }
    }
}
